//! # `ResNet` Trunk
//!
//! The [`ResNetTrunk`] is the shared feature extractor of a multi-head model:
//! a 3x3 conv/norm/act stem followed by four [`LayerBlock`] stages.
//!
//! [`ResNetTrunkConfig`] implements [`Config`], and provides
//! [`ResNetTrunkConfig::init`] to initialize a [`ResNetTrunk`].

use crate::layers::blocks::cna::{CNA2d, CNA2dConfig, CNA2dMeta};
use crate::models::resnet::layer_block::{
    LayerBlock, LayerBlockConfig, LayerBlockMeta, StageSpec, build_stages,
};
use crate::models::resnet::residual_block::BlockKind;
use crate::models::resnet::util::{
    CONV_INTO_RELU_INITIALIZER, scalar_to_array, stride_div_output_resolution,
};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::Conv2dConfig;
use burn::prelude::{Backend, Tensor};

/// Input image channels.
pub const IMAGE_CHANNELS: usize = 3;

/// Default base width; the stem and stage 1 width.
pub const DEFAULT_IN_PLANES: usize = 64;

/// Widths of stages 2, 3, and 4.
pub const UPPER_STAGE_PLANES: [usize; 3] = [128, 256, 512];

/// Stage entry strides.
pub const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

/// [`ResNetTrunk`] Meta API.
pub trait ResNetTrunkMeta {
    /// The number of output feature planes.
    fn out_planes(&self) -> usize;

    /// The effective stride of the trunk.
    fn stride(&self) -> usize;

    /// Get the feature map resolution for a given image resolution.
    ///
    /// # Panics
    ///
    /// If the input resolution is not a multiple of the stride.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_div_output_resolution(input_resolution, self.stride())
    }
}

/// [`ResNetTrunk`] Config.
#[derive(Config, Debug)]
pub struct ResNetTrunkConfig {
    /// The residual block variant.
    pub block: BlockKind,

    /// Number of blocks in each stage.
    pub layers: [usize; 4],

    /// Stem output width, and default width of stage 1.
    #[config(default = "DEFAULT_IN_PLANES")]
    pub in_planes: usize,

    /// Optional override for the four stage widths.
    ///
    /// Defaults to ``[in_planes, 128, 256, 512]``.
    #[config(default = "None")]
    pub stage_planes: Option<[usize; 4]>,
}

impl ResNetTrunkMeta for ResNetTrunkConfig {
    fn out_planes(&self) -> usize {
        self.effective_stage_planes()[3] * self.block.expansion_factor()
    }

    fn stride(&self) -> usize {
        STAGE_STRIDES.iter().product()
    }
}

impl ResNetTrunkConfig {
    /// The four stage widths; resolves the `stage_planes` override.
    pub fn effective_stage_planes(&self) -> [usize; 4] {
        self.stage_planes.unwrap_or([
            self.in_planes,
            UPPER_STAGE_PLANES[0],
            UPPER_STAGE_PLANES[1],
            UPPER_STAGE_PLANES[2],
        ])
    }

    /// The stage descriptions, in order.
    pub fn stage_specs(&self) -> Vec<StageSpec> {
        self.effective_stage_planes()
            .iter()
            .zip(self.layers.iter())
            .zip(STAGE_STRIDES.iter())
            .map(|((&planes, &num_blocks), &stride)| {
                StageSpec::new(planes, num_blocks).with_stride(stride)
            })
            .collect()
    }

    /// Build the stage configs.
    ///
    /// # Returns
    ///
    /// ``(stages, out_planes)``
    pub fn build_stages(&self) -> (Vec<LayerBlockConfig>, usize) {
        build_stages(self.block, self.in_planes, &self.stage_specs())
    }

    /// Initialize a [`ResNetTrunk`].
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> ResNetTrunk<B> {
        let stem: CNA2dConfig =
            Conv2dConfig::new([IMAGE_CHANNELS, self.in_planes], scalar_to_array(3))
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(CONV_INTO_RELU_INITIALIZER.clone())
                .with_bias(false)
                .into();

        let (stages, _) = self.build_stages();

        ResNetTrunk {
            stem: stem.init(device),
            layers: stages.into_iter().map(|c| c.init(device)).collect(),
        }
    }
}

/// Stem + four stages.
#[derive(Module, Debug)]
pub struct ResNetTrunk<B: Backend> {
    /// Input conv/norm/act.
    pub stem: CNA2d<B>,

    /// Residual stages.
    pub layers: Vec<LayerBlock<B>>,
}

impl<B: Backend> ResNetTrunkMeta for ResNetTrunk<B> {
    fn out_planes(&self) -> usize {
        self.layers
            .last()
            .map(|layer| layer.out_planes())
            .unwrap_or_else(|| self.stem.out_channels())
    }

    fn stride(&self) -> usize {
        self.layers
            .iter()
            .fold(self.stem.stride()[0], |acc, layer| acc * layer.stride())
    }
}

impl<B: Backend> ResNetTrunk<B> {
    /// Trunk forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, 3, in_height=out_height*stride, in_width=out_width*stride]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes, out_height, out_width]`` feature map.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, out_height, out_width] = unpack_shape_contract!(
            [
                "batch",
                "channels",
                "in_height" = "out_height" * "stride",
                "in_width" = "out_width" * "stride"
            ],
            &input,
            &["batch", "out_height", "out_width"],
            &[("channels", IMAGE_CHANNELS), ("stride", self.stride())],
        );

        let x = self.stem.forward(input);
        let x = self.layers.iter().fold(x, |x, layer| layer.forward(x));

        assert_shape_contract_periodically!(
            ["batch", "out_planes", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_planes", self.out_planes()),
                ("out_height", out_height),
                ("out_width", out_width)
            ],
        );

        x
    }

    /// Mark every trunk parameter as non-trainable.
    pub fn freeze(self) -> Self {
        self.no_grad()
    }
}
