//! # Multi-Head `ResNet` Model
//!
//! [`MultiHeadResNet`] shares one [`ResNetTrunk`] between 2 to 4
//! classification heads:
//!
//! ```text
//! image -> stem -> stage 1..4 -> pool -> [number, color, location?, scale?]
//! ```
//!
//! [`MultiHeadResNetConfig`] implements [`Config`], and provides
//! [`MultiHeadResNetConfig::init`] to initialize a [`MultiHeadResNet`].

use crate::layers::heads::{HeadBank, HeadBankConfig, HeadOutputs};
use crate::models::resnet::pooling::{
    FeaturePool, FeaturePoolConfig, PROJECTION_FAN_IN, pool_window,
};
use crate::models::resnet::trunk::{ResNetTrunk, ResNetTrunkConfig, ResNetTrunkMeta};
use crate::models::resnet::resnet_io::pytorch_stubs::load_pytorch_weights;
use crate::utility::burn::state_dict::StateDictMerge;
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::prelude::{Backend, Tensor};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of a pooled model trained from scratch.
pub const RESNET_NAME: &str = "resnet";

/// Name of a pooled, pretrained, fine-tuned model.
pub const RESNET_PRETRAINED_NAME: &str = "resnet_pretrained";

/// Name of a pooled, pretrained model with a frozen trunk.
pub const RESNET_PRETRAINED_EMBEDDINGS_NAME: &str = "resnet_pretrained_embeddings";

/// Name of a projection-pooled model.
pub const RESNET_NO_POOL_NAME: &str = "resnet_no_pool";

/// Pick the model name for a construction mode.
pub fn model_name(
    pool: bool,
    pretrained: bool,
    fine_tune: bool,
) -> &'static str {
    match (pool, pretrained, fine_tune) {
        (false, _, _) => RESNET_NO_POOL_NAME,
        (true, false, _) => RESNET_NAME,
        (true, true, true) => RESNET_PRETRAINED_NAME,
        (true, true, false) => RESNET_PRETRAINED_EMBEDDINGS_NAME,
    }
}

/// Trainability of a parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamGroupState {
    /// Parameters track gradients.
    Trainable,

    /// Parameters are excluded from gradient tracking.
    Frozen,
}

impl ParamGroupState {
    /// Is the group trainable?
    pub fn is_trainable(&self) -> bool {
        matches!(self, Self::Trainable)
    }
}

/// [`MultiHeadResNet`] Config.
#[derive(Config, Debug)]
pub struct MultiHeadResNetConfig {
    /// The shared trunk.
    pub trunk: ResNetTrunkConfig,

    /// Label count of each head; 2 to 4 heads.
    #[config(default = "vec![10, 10]")]
    pub classes: Vec<usize>,

    /// Average pool when true; dense projection when false.
    #[config(default = true)]
    pub pool: bool,
}

impl MultiHeadResNetConfig {
    /// The number of heads.
    pub fn num_heads(&self) -> usize {
        self.classes.len()
    }

    /// Width of the pooled feature; the head input width.
    pub fn features(&self) -> usize {
        self.trunk.out_planes()
    }

    /// The [`HeadBank`] config.
    pub fn head_config(&self) -> HeadBankConfig {
        HeadBankConfig::new(self.features(), self.classes.clone())
    }

    /// The [`FeaturePool`] config.
    pub fn pool_config(&self) -> FeaturePoolConfig {
        FeaturePoolConfig::new(self.features(), self.num_heads()).with_pool(self.pool)
    }

    /// The square image resolution the pooling stage accepts, if any.
    ///
    /// Pooled models need a final map of exactly ``window x window``;
    /// projection models need ``out_planes * h * w == PROJECTION_FAN_IN``.
    pub fn input_resolution(&self) -> Option<[usize; 2]> {
        let side = if self.pool {
            Some(pool_window(self.num_heads()))
        } else {
            let features = self.features();
            let side = ((PROJECTION_FAN_IN / features) as f64).sqrt() as usize;
            (features * side * side == PROJECTION_FAN_IN).then_some(side)
        };
        side.map(|side| [side * self.trunk.stride(); 2])
    }

    /// Check if the config is valid.
    ///
    /// # Returns
    ///
    /// A `Result<(), String>`
    pub fn try_validate(&self) -> Result<(), String> {
        self.head_config().try_validate()
    }

    /// Initialize a [`MultiHeadResNet`].
    ///
    /// Every parameter starts trainable.
    ///
    /// # Panics
    ///
    /// If the head config is not valid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> MultiHeadResNet<B> {
        let heads = self.head_config();
        heads.expect_valid();

        MultiHeadResNet {
            trunk: self.trunk.clone().init(device),
            pooling: self.pool_config().init(device),
            heads: heads.init(device),
            name: Ignored(model_name(self.pool, false, true).to_string()),
            trunk_state: Ignored(ParamGroupState::Trainable),
            head_state: Ignored(ParamGroupState::Trainable),
        }
    }
}

/// Multi-head `ResNet`.
#[derive(Module, Debug)]
pub struct MultiHeadResNet<B: Backend> {
    /// Shared stem and stages.
    pub trunk: ResNetTrunk<B>,

    /// Trunk to head reduction.
    pub pooling: FeaturePool<B>,

    /// The classification heads.
    pub heads: HeadBank<B>,

    /// Informational model name.
    pub name: Ignored<String>,

    /// Trainability of the trunk.
    pub trunk_state: Ignored<ParamGroupState>,

    /// Trainability of the pooling projection and heads.
    pub head_state: Ignored<ParamGroupState>,
}

impl<B: Backend> MultiHeadResNet<B> {
    /// The model name.
    pub fn name(&self) -> &str {
        &self.name.0
    }

    /// Replace the model name.
    pub fn with_name(
        self,
        name: &str,
    ) -> Self {
        Self {
            name: Ignored(name.to_string()),
            ..self
        }
    }

    /// The number of heads.
    pub fn num_heads(&self) -> usize {
        self.heads.num_heads()
    }

    /// Trainability of the stem and stages.
    pub fn trunk_state(&self) -> ParamGroupState {
        self.trunk_state.0
    }

    /// Trainability of the pooling projection and heads.
    pub fn head_state(&self) -> ParamGroupState {
        self.head_state.0
    }

    /// Freeze every stem and stage parameter.
    ///
    /// Idempotent; the pooling projection and heads keep their state.
    pub fn freeze_trunk(self) -> Self {
        Self {
            trunk: self.trunk.freeze(),
            trunk_state: Ignored(ParamGroupState::Frozen),
            ..self
        }
    }

    /// Leniently load data-parallel ``torch`` weights.
    ///
    /// See [`load_pytorch_weights`].
    pub fn load_pytorch_weights(
        self,
        path: PathBuf,
    ) -> anyhow::Result<(Self, StateDictMerge)> {
        load_pytorch_weights(self, path)
    }

    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, 3, height, width]``.
    ///
    /// # Returns
    ///
    /// One ``[batch, classes_i]`` log-probability tensor per head.
    ///
    /// # Panics
    ///
    /// If the final feature map does not fit the pooling stage.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> HeadOutputs<B> {
        let x = self.trunk.forward(input);
        let x = self.pooling.forward(x);
        self.heads.forward(x)
    }
}
