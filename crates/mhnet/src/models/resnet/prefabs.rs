//! # Multi-Head `ResNet` Factories
//!
//! Well-known trunk depths, the construction options shared by every
//! factory, and the factories themselves.
//!
//! Factory order is fixed: build the structural model, optionally overlay
//! pretrained ``torch`` weights, then freeze the trunk unless fine-tuning.

use crate::models::resnet::residual_block::BlockKind;
use crate::models::resnet::resnet_model::{MultiHeadResNet, MultiHeadResNetConfig, model_name};
use crate::models::resnet::trunk::{DEFAULT_IN_PLANES, ResNetTrunkConfig};
use anyhow::{Context, bail};
use burn::config::Config;
use burn::prelude::Backend;
use std::path::PathBuf;

/// [`BlockKind::Basic`] blocks per stage of `ResNet-18`.
pub const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];

/// [`BlockKind::Bottleneck`] blocks per stage of `ResNet-50`.
pub const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];

/// Default pretrained weights location; a data-parallel ``torch`` state dict.
pub const DEFAULT_CHECKPOINT_PATH: &str = "models/st_dict_epoch71.pt";

/// Options shared by the multi-head factories.
#[derive(Config, Debug)]
pub struct MultiHeadOptions {
    /// Keep the trunk trainable; when false the stem and stages are frozen.
    #[config(default = false)]
    pub fine_tune: bool,

    /// Label count of each head; 2 to 4 heads.
    #[config(default = "vec![10, 10]")]
    pub classes: Vec<usize>,

    /// Average pool when true; dense projection when false.
    #[config(default = true)]
    pub pool: bool,

    /// Overlay the ``torch`` weights at `checkpoint_path`.
    #[config(default = false)]
    pub pretrained: bool,

    /// Stem output width, and default width of stage 1.
    #[config(default = "DEFAULT_IN_PLANES")]
    pub in_planes: usize,

    /// Optional override for the four stage widths.
    #[config(default = "None")]
    pub stage_planes: Option<[usize; 4]>,

    /// Path of the pretrained ``torch`` weights.
    #[config(default = "DEFAULT_CHECKPOINT_PATH.to_string()")]
    pub checkpoint_path: String,
}

impl Default for MultiHeadOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiHeadOptions {
    /// The structural config for a trunk of `block` x `layers`.
    pub fn to_config(
        &self,
        block: BlockKind,
        layers: [usize; 4],
    ) -> MultiHeadResNetConfig {
        let trunk = ResNetTrunkConfig::new(block, layers)
            .with_in_planes(self.in_planes)
            .with_stage_planes(self.stage_planes);

        MultiHeadResNetConfig::new(trunk)
            .with_classes(self.classes.clone())
            .with_pool(self.pool)
    }

    /// The name the built model will carry.
    pub fn model_name(&self) -> &'static str {
        model_name(self.pool, self.pretrained, self.fine_tune)
    }
}

/// A well-known multi-head `ResNet` configuration.
#[derive(Debug)]
pub struct StaticResNetPreFab {
    /// Name of the configuration.
    pub name: &'static str,

    /// Description of the configuration.
    pub description: &'static str,

    /// The residual block variant.
    pub block: BlockKind,

    /// Blocks per stage.
    pub layers: [usize; 4],

    /// Are pretrained weights published for this configuration?
    pub has_pretrained: bool,
}

/// `ResNet-18`; basic blocks, pretrained weights available.
pub static RESNET18_PREFAB: StaticResNetPreFab = StaticResNetPreFab {
    name: "resnet18",
    description: "ResNet-18 [2, 2, 2, 2] BasicBlocks",
    block: BlockKind::Basic,
    layers: RESNET18_BLOCKS,
    has_pretrained: true,
};

/// `ResNet-50`; bottleneck blocks, no pretrained weights.
pub static RESNET50_PREFAB: StaticResNetPreFab = StaticResNetPreFab {
    name: "resnet50",
    description: "ResNet-50 [3, 4, 6, 3] BottleneckBlocks",
    block: BlockKind::Bottleneck,
    layers: RESNET50_BLOCKS,
    has_pretrained: false,
};

/// Every well-known configuration.
pub static RESNET_PREFABS: &[&StaticResNetPreFab] = &[&RESNET18_PREFAB, &RESNET50_PREFAB];

/// Lookup a well-known configuration by name.
pub fn lookup_prefab(name: &str) -> anyhow::Result<&'static StaticResNetPreFab> {
    match RESNET_PREFABS.iter().find(|p| p.name == name) {
        Some(prefab) => Ok(*prefab),
        None => bail!(
            "Unknown ResNet prefab: {}; expected one of {:?}",
            name,
            prefab_names()
        ),
    }
}

/// The names of every well-known configuration.
pub fn prefab_names() -> Vec<&'static str> {
    RESNET_PREFABS.iter().map(|p| p.name).collect()
}

impl StaticResNetPreFab {
    /// The structural config for these options.
    pub fn to_config(
        &self,
        options: &MultiHeadOptions,
    ) -> MultiHeadResNetConfig {
        options.to_config(self.block, self.layers)
    }

    /// Build the model.
    ///
    /// Fails before construction if pretrained weights are requested but
    /// not published for this configuration.
    pub fn build<B: Backend>(
        &self,
        options: &MultiHeadOptions,
        device: &B::Device,
    ) -> anyhow::Result<MultiHeadResNet<B>> {
        if options.pretrained && !self.has_pretrained {
            bail!("Pretrained weights not yet available for {}", self.name);
        }
        multi_head_resnet(self.block, self.layers, options, device)
    }
}

/// Build a multi-head `ResNet` of any depth.
///
/// # Arguments
///
/// - `block`: the residual block variant.
/// - `layers`: blocks per stage.
/// - `options`: head, pooling, pretrained, and freezing options.
/// - `device`: the target device.
///
/// # Errors
///
/// If the options are invalid, or the pretrained weights cannot be read.
#[tracing::instrument(skip(options, device))]
pub fn multi_head_resnet<B: Backend>(
    block: BlockKind,
    layers: [usize; 4],
    options: &MultiHeadOptions,
    device: &B::Device,
) -> anyhow::Result<MultiHeadResNet<B>> {
    let config = options.to_config(block, layers);
    if let Err(err) = config.try_validate() {
        bail!("Invalid multi-head options: {}", err);
    }

    let mut model: MultiHeadResNet<B> = config.init(device);

    if options.pretrained {
        let (loaded, merge) = model
            .load_pytorch_weights(PathBuf::from(&options.checkpoint_path))
            .with_context(|| format!("loading pretrained weights from {}", options.checkpoint_path))?;
        tracing::debug!(
            loaded = merge.loaded(),
            unexpected = merge.unexpected.len(),
            missing = merge.missing.len(),
            mismatched = merge.mismatched.len(),
            "applied pretrained weights"
        );
        model = loaded;
    }

    if !options.fine_tune {
        model = model.freeze_trunk();
    }

    let model = model.with_name(options.model_name());
    tracing::info!(
        name = model.name(),
        heads = model.num_heads(),
        trunk = ?model.trunk_state(),
        "built multi-head resnet"
    );

    Ok(model)
}

/// Build a multi-head `ResNet-18`.
///
/// See [`RESNET18_PREFAB`].
pub fn resnet18<B: Backend>(
    options: &MultiHeadOptions,
    device: &B::Device,
) -> anyhow::Result<MultiHeadResNet<B>> {
    RESNET18_PREFAB.build(options, device)
}

/// Build a multi-head `ResNet-50`.
///
/// See [`RESNET50_PREFAB`].
///
/// # Errors
///
/// Always, when `options.pretrained` is set.
pub fn resnet50<B: Backend>(
    options: &MultiHeadOptions,
    device: &B::Device,
) -> anyhow::Result<MultiHeadResNet<B>> {
    RESNET50_PREFAB.build(options, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resnet::resnet_model::ParamGroupState;
    use burn::backend::NdArray;
    use burn::prelude::Tensor;
    use burn::tensor::{Distribution, Int};

    const NARROW_PLANES: [usize; 4] = [4, 8, 8, 16];

    /// Data-parallel weights for [`narrow_options`]; heads ``10, 10, 9``.
    const NARROW_RESNET18_PT: &str =
        concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/narrow_resnet18.pt");

    fn narrow_options() -> MultiHeadOptions {
        MultiHeadOptions::new()
            .with_in_planes(4)
            .with_stage_planes(Some(NARROW_PLANES))
    }

    #[test]
    fn test_options_defaults() {
        let options = MultiHeadOptions::default();
        assert!(!options.fine_tune);
        assert_eq!(options.classes, vec![10, 10]);
        assert!(options.pool);
        assert!(!options.pretrained);
        assert_eq!(options.in_planes, 64);
        assert_eq!(options.stage_planes, None);
        assert_eq!(options.checkpoint_path, "models/st_dict_epoch71.pt");
        assert_eq!(options.model_name(), "resnet");

        let config = options.to_config(BlockKind::Bottleneck, RESNET50_BLOCKS);
        assert_eq!(config.features(), 2048);
        assert_eq!(config.trunk.layers, [3, 4, 6, 3]);
    }

    #[test]
    fn test_lookup_prefab() {
        assert_eq!(prefab_names(), vec!["resnet18", "resnet50"]);

        let prefab = lookup_prefab("resnet18").unwrap();
        assert_eq!(prefab.layers, RESNET18_BLOCKS);
        assert_eq!(prefab.description, "ResNet-18 [2, 2, 2, 2] BasicBlocks");
        assert!(prefab.has_pretrained);

        let prefab = lookup_prefab("resnet50").unwrap();
        assert_eq!(prefab.block, BlockKind::Bottleneck);
        assert!(!prefab.has_pretrained);
        let config = prefab.to_config(&MultiHeadOptions::new().with_pool(false));
        assert_eq!(config.trunk.layers, RESNET50_BLOCKS);
        assert!(!config.pool);

        let err = lookup_prefab("resnet34").unwrap_err();
        assert_eq!(
            format!("{err}"),
            r#"Unknown ResNet prefab: resnet34; expected one of ["resnet18", "resnet50"]"#
        );
    }

    #[test]
    fn test_resnet50_pretrained_fails() {
        type B = NdArray;
        let device = Default::default();

        let err = resnet50::<B>(&MultiHeadOptions::new().with_pretrained(true), &device)
            .unwrap_err();
        assert_eq!(
            format!("{err}"),
            "Pretrained weights not yet available for resnet50"
        );
    }

    #[test]
    fn test_invalid_head_count_fails() {
        type B = NdArray;
        let device = Default::default();

        let options = narrow_options().with_classes(vec![10, 10, 10, 10, 10]);
        let err = resnet18::<B>(&options, &device).unwrap_err();
        assert!(format!("{err}").starts_with("Invalid multi-head options"));
    }

    #[test]
    fn test_resnet18_missing_checkpoint_fails() {
        type B = NdArray;
        let device = Default::default();

        let dir = tempfile::tempdir().unwrap();
        let options = narrow_options()
            .with_pretrained(true)
            .with_checkpoint_path(dir.path().join("absent.pt").display().to_string());

        let err = resnet18::<B>(&options, &device).unwrap_err();
        assert!(format!("{err}").starts_with("loading pretrained weights"));
    }

    #[test]
    fn test_factories_build() {
        type B = NdArray;
        let device = Default::default();

        let model = resnet18::<B>(&narrow_options().with_fine_tune(true), &device).unwrap();
        assert_eq!(model.name(), "resnet");
        assert_eq!(model.trunk_state(), ParamGroupState::Trainable);
        assert_eq!(model.trunk.layers.iter().map(|l| l.blocks.len()).sum::<usize>(), 8);

        let input = Tensor::random([2, 3, 32, 32], Distribution::Default, &device);
        let outputs = model.forward(input).into_vec();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].dims(), [2, 10]);

        let model = resnet50::<B>(&narrow_options().with_pool(false), &device).unwrap();
        assert_eq!(model.name(), "resnet_no_pool");
        assert_eq!(model.trunk_state(), ParamGroupState::Frozen);
        assert_eq!(model.heads.in_features(), 64);
    }

    #[test]
    fn test_resnet18_pretrained() {
        type B = NdArray;
        let device = Default::default();

        let options = narrow_options()
            .with_pretrained(true)
            .with_checkpoint_path(NARROW_RESNET18_PT.to_string());

        let expected_stem: Tensor<B, 4> = Tensor::full([4, 3, 3, 3], 0.25, &device);

        let model = resnet18::<B>(&options, &device).unwrap();
        assert_eq!(model.name(), "resnet_pretrained_embeddings");
        assert_eq!(model.trunk_state(), ParamGroupState::Frozen);
        assert_eq!(model.head_state(), ParamGroupState::Trainable);
        model
            .trunk
            .stem
            .conv
            .weight
            .val()
            .to_data()
            .assert_eq(&expected_stem.to_data(), true);

        let model = resnet18::<B>(&options.with_fine_tune(true), &device).unwrap();
        assert_eq!(model.name(), "resnet_pretrained");
        assert_eq!(model.trunk_state(), ParamGroupState::Trainable);
        model
            .trunk
            .stem
            .conv
            .weight
            .val()
            .to_data()
            .assert_eq(&expected_stem.to_data(), true);

        // ``fc2_color.bias[o] == o``.
        let expected_bias: Tensor<B, 1> = Tensor::<B, 1, Int>::arange(0..10, &device).float();
        let color_bias = model.heads.color.bias.as_ref().unwrap().val();
        color_bias
            .to_data()
            .assert_eq(&expected_bias.to_data(), true);
    }

    #[test]
    fn test_resnet18_pretrained_three_heads() {
        type B = NdArray;
        let device = Default::default();

        let options = narrow_options()
            .with_classes(vec![10, 10, 9])
            .with_pretrained(true)
            .with_checkpoint_path(NARROW_RESNET18_PT.to_string());

        let model = resnet18::<B>(&options, &device).unwrap();
        let location = model.heads.location.as_ref().unwrap();
        assert_eq!(location.weight.val().dims(), [16, 9]);

        let values = location.weight.val().to_data().to_vec::<f32>().unwrap();
        assert_eq!(values[9], 1.0);
        assert_eq!(values[1], 100.0);
    }
}
