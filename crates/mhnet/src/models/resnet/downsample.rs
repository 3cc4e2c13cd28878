//! # The `ResNet` Shortcut Projection.
//!
//! A [`ConvDownsample`] projects the residual input onto the
//! output shape of a block's main path, when the two differ;
//! a strided 1x1 [`Conv2d`] followed by a [`BatchNorm`].

use crate::models::resnet::util::{
    CONV_INTO_RELU_INITIALIZER, scalar_to_array, stride_div_output_resolution,
};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::prelude::{Backend, Config, Module, Tensor};

/// Does a block with this geometry need a projected shortcut?
///
/// A projection is required iff the stride is not 1,
/// or the channel counts differ.
pub fn needs_projection(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
) -> bool {
    stride != 1 || in_planes != out_planes
}

/// [`ConvDownsample`] Meta trait.
pub trait ConvDownsampleMeta {
    /// The size of the in channels dimension.
    fn in_channels(&self) -> usize;

    /// The size of the out channels dimension.
    fn out_channels(&self) -> usize;

    /// The stride of the downsample layer.
    fn stride(&self) -> usize;

    /// Get the output resolution for a given input resolution.
    ///
    /// The input must be a multiple of the stride.
    ///
    /// # Arguments
    ///
    /// - `input_resolution`: ``[in_height=out_height*stride, in_width=out_width*stride]``.
    ///
    /// # Returns
    ///
    /// ``[out_height, out_width]``
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

/// [`ConvDownsample`] configuration.
#[derive(Config, Debug)]
pub struct ConvDownsampleConfig {
    /// The size of the in channels dimension.
    in_channels: usize,

    /// The size of the out channels dimension.
    out_channels: usize,

    /// The stride of the downsample layer.
    #[config(default = 1)]
    stride: usize,

    /// The [`Conv2d`] initializer.
    #[config(default = "CONV_INTO_RELU_INITIALIZER.clone()")]
    pub initializer: Initializer,
}

impl ConvDownsampleMeta for ConvDownsampleConfig {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

impl ConvDownsampleConfig {
    /// Build the shortcut config for a block geometry.
    ///
    /// Returns `None` when the identity shortcut suffices.
    pub fn for_block(
        in_planes: usize,
        out_planes: usize,
        stride: usize,
    ) -> Option<Self> {
        if needs_projection(in_planes, out_planes, stride) {
            Some(Self::new(in_planes, out_planes).with_stride(stride))
        } else {
            None
        }
    }

    /// Initialize a [`ConvDownsample`] `Module`.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ConvDownsample<B> {
        ConvDownsample {
            conv: Conv2dConfig::new([self.in_channels, self.out_channels], scalar_to_array(1))
                .with_stride(scalar_to_array(self.stride))
                .with_padding(PaddingConfig2d::Explicit(0, 0))
                .with_initializer(self.initializer.clone())
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.out_channels).init(device),
        }
    }
}

/// Downsample layer applies a 1x1 conv to reduce the resolution (H, W) and adjust the number of channels.
///
/// Maps ``[batch_size, in_channels, in_height, in_width]`` to
/// ``[batch_size, out_channels, out_height, out_width]`` tensors.
#[derive(Module, Debug)]
pub struct ConvDownsample<B: Backend> {
    /// Strided 1x1 projection.
    pub conv: Conv2d<B>,

    /// Norm over the projected channels.
    pub norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvDownsampleMeta for ConvDownsample<B> {
    fn in_channels(&self) -> usize {
        self.conv.weight.shape().dims[1] * self.conv.groups
    }

    fn out_channels(&self) -> usize {
        self.conv.weight.shape().dims[0]
    }

    fn stride(&self) -> usize {
        self.conv.stride[0]
    }
}

impl<B: Backend> ConvDownsample<B> {
    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: a ``[batch, in_channels, in_height=out_height*stride, in_width=out_width*stride]`` tensor.
    ///
    /// # Returns
    ///
    /// A ``[batch_size, out_channels, out_height, out_width]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, out_height, out_width] = unpack_shape_contract!(
            [
                "batch",
                "in_channels",
                "in_height" = "out_height" * "stride",
                "in_width" = "out_width" * "stride"
            ],
            &input,
            &["batch", "out_height", "out_width"],
            &[
                ("in_channels", self.in_channels()),
                ("stride", self.stride())
            ]
        );

        let out = self.norm.forward(self.conv.forward(input));

        assert_shape_contract_periodically!(
            ["batch", "out_channels", "out_height", "out_width"],
            &out,
            &[
                ("batch", batch),
                ("out_channels", self.out_channels()),
                ("out_height", out_height),
                ("out_width", out_width)
            ]
        );

        out
    }
}

/// Apply an optional shortcut projection.
///
/// `None` is the identity shortcut, and returns the input unchanged.
pub fn apply_shortcut<B: Backend>(
    downsample: &Option<ConvDownsample<B>>,
    input: Tensor<B, 4>,
) -> Tensor<B, 4> {
    match downsample {
        Some(downsample) => downsample.forward(input),
        None => input,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;

    #[test]
    fn test_needs_projection() {
        assert!(!needs_projection(64, 64, 1));
        assert!(needs_projection(64, 64, 2));
        assert!(needs_projection(64, 128, 1));
        assert!(needs_projection(64, 256, 2));
    }

    #[test]
    fn test_conv_downsample_config() {
        let config = ConvDownsampleConfig::new(2, 4);
        assert_eq!(config.in_channels(), 2);
        assert_eq!(config.out_channels(), 4);
        assert_eq!(config.stride(), 1);
        assert_eq!(config.output_resolution([8, 8]), [8, 8]);

        let config = config.with_stride(2);
        assert_eq!(config.stride(), 2);
        assert_eq!(config.output_resolution([8, 8]), [4, 4]);
    }

    #[test]
    fn test_conv_downsample_for_block() {
        assert!(ConvDownsampleConfig::for_block(8, 8, 1).is_none());

        let config = ConvDownsampleConfig::for_block(8, 32, 2).unwrap();
        assert_eq!(config.in_channels(), 8);
        assert_eq!(config.out_channels(), 32);
        assert_eq!(config.stride(), 2);
    }

    #[test]
    #[should_panic(expected = "7 !~ height_in=(height_out*stride)")]
    fn test_conv_downsample_config_panic() {
        let config = ConvDownsampleConfig::new(2, 4).with_stride(2);
        config.output_resolution([7, 7]);
    }

    #[test]
    fn test_conv_downsample() {
        type B = NdArray<f32>;
        let device = Default::default();

        let batch_size = 2;
        let in_channels = 2;
        let out_channels = 4;
        let in_height = 8;
        let in_width = 8;

        let downsample: ConvDownsample<B> = ConvDownsampleConfig::new(in_channels, out_channels)
            .with_stride(2)
            .init(&device);

        assert_eq!(downsample.in_channels(), in_channels);
        assert_eq!(downsample.out_channels(), out_channels);
        assert_eq!(downsample.stride(), 2);
        assert!(downsample.conv.bias.is_none());
        assert_eq!(downsample.conv.weight.dims(), [out_channels, in_channels, 1, 1]);

        let tensor = Tensor::ones([batch_size, in_channels, in_height, in_width], &device);
        let out = downsample.forward(tensor);

        assert_shape_contract!(
            ["batch", "out_channels", "out_height", "out_width"],
            &out,
            &[
                ("batch", batch_size),
                ("out_channels", out_channels),
                ("out_height", in_height / 2),
                ("out_width", in_width / 2)
            ]
        );
    }

    #[test]
    fn test_identity_shortcut_is_a_no_op() {
        type B = NdArray<f32>;
        let device = Default::default();

        let input: Tensor<B, 4> = Tensor::random(
            [2, 3, 4, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let output = apply_shortcut(&None, input.clone());
        output.to_data().assert_eq(&input.to_data(), true);
    }
}
