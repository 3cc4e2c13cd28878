//! # [`BottleneckBlock`] Block for `ResNet`
//!
//! [`BottleneckBlock`] is the bottleneck form of the core `ResNet` convolution unit.
//!
//! [`BottleneckBlockMeta`] defines a common meta API for [`BottleneckBlock`]
//! and [`BottleneckBlockConfig`].
//!
//! [`BottleneckBlockConfig`] implements [`Config`], and provides
//! [`BottleneckBlockConfig::init`] to initialize a [`BottleneckBlock`].
//!
//! [`BottleneckBlock`] implements [`Module`], and provides
//! [`BottleneckBlock::forward`].

use crate::layers::blocks::cna::{CNA2d, CNA2dConfig, CNA2dMeta};
use crate::models::resnet::downsample::{ConvDownsample, ConvDownsampleConfig, apply_shortcut};
use crate::models::resnet::util::{
    CONV_INTO_RELU_INITIALIZER, scalar_to_array, stride_div_output_resolution,
};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::nn::PaddingConfig2d;
use burn::nn::conv::Conv2dConfig;
use burn::prelude::{Backend, Config, Module, Tensor};

/// [`BottleneckBlock`] expansion factor.
pub const BOTTLENECK_EXPANSION: usize = 4;

/// [`BottleneckBlock`] Meta trait.
pub trait BottleneckBlockMeta {
    /// The number of input feature planes.
    fn in_planes(&self) -> usize;

    /// Width of the inner (squeezed) convolutions.
    fn planes(&self) -> usize;

    /// Control factor for `out_planes()`
    fn expansion_factor(&self) -> usize {
        BOTTLENECK_EXPANSION
    }

    /// The number of output feature planes.
    ///
    /// ``out_planes = planes * expansion_factor``
    fn out_planes(&self) -> usize {
        self.planes() * self.expansion_factor()
    }

    /// The stride of the middle (3x3) convolution.
    ///
    /// Affects downsample behavior.
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

/// [`BottleneckBlock`] Config.
///
/// Implements [`BottleneckBlockMeta`].
#[derive(Config, Debug)]
pub struct BottleneckBlockConfig {
    /// The size of the in channels dimension.
    pub in_planes: usize,

    /// Configures the inner width and `out_planes`.
    pub planes: usize,

    /// The stride of the middle conv, and of the downsample layer.
    #[config(default = 1)]
    pub stride: usize,
}

impl BottleneckBlockMeta for BottleneckBlockConfig {
    fn in_planes(&self) -> usize {
        self.in_planes
    }

    fn planes(&self) -> usize {
        self.planes
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

impl BottleneckBlockConfig {
    /// Initialize a [`BottleneckBlock`].
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> BottleneckBlock<B> {
        let in_planes = self.in_planes();
        let planes = self.planes();
        let out_planes = self.out_planes();
        let stride = self.stride();

        let downsample = ConvDownsampleConfig::for_block(in_planes, out_planes, stride);

        let cna1: CNA2dConfig = Conv2dConfig::new([in_planes, planes], scalar_to_array(1))
            .with_initializer(CONV_INTO_RELU_INITIALIZER.clone())
            .with_bias(false)
            .into();

        let cna2: CNA2dConfig = Conv2dConfig::new([planes, planes], scalar_to_array(3))
            .with_stride(scalar_to_array(stride))
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_initializer(CONV_INTO_RELU_INITIALIZER.clone())
            .with_bias(false)
            .into();

        let cna3: CNA2dConfig = Conv2dConfig::new([planes, out_planes], scalar_to_array(1))
            .with_initializer(CONV_INTO_RELU_INITIALIZER.clone())
            .with_bias(false)
            .into();

        BottleneckBlock {
            downsample: downsample.as_ref().map(|c| c.init(device)),
            cna1: cna1.init(device),
            cna2: cna2.init(device),
            cna3: cna3.init(device),
        }
    }
}

/// Bottleneck Block for `ResNet`.
///
/// Implements [`BottleneckBlockMeta`].
#[derive(Module, Debug)]
pub struct BottleneckBlock<B: Backend> {
    /// Optional `DownSample` layer; for the residual connection.
    ///
    /// `None` is the identity shortcut.
    pub downsample: Option<ConvDownsample<B>>,

    /// First conv/norm/act layer; 1x1 squeeze.
    pub cna1: CNA2d<B>,

    /// Second conv/norm/act layer; strided 3x3.
    pub cna2: CNA2d<B>,

    /// Third conv/norm/act layer; 1x1 expand.
    ///
    /// The residual sum is hooked in before the activation.
    pub cna3: CNA2d<B>,
}

impl<B: Backend> BottleneckBlockMeta for BottleneckBlock<B> {
    fn in_planes(&self) -> usize {
        self.cna1.in_channels()
    }

    fn planes(&self) -> usize {
        self.cna1.out_channels()
    }

    fn out_planes(&self) -> usize {
        self.cna3.out_channels()
    }

    fn stride(&self) -> usize {
        self.cna2.stride()[0]
    }
}

impl<B: Backend> BottleneckBlock<B> {
    /// The residual shortcut path.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_planes, in_height=out_height*stride, in_width=out_width*stride]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes, out_height, out_width]`` tensor.
    pub fn shortcut(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        apply_shortcut(&self.downsample, input)
    }

    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_planes, in_height=out_height*stride, in_width=out_width*stride]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes=planes*expansion_factor, out_height, out_width]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, out_height, out_width] = unpack_shape_contract!(
            [
                "batch",
                "in_planes",
                "in_height" = "out_height" * "stride",
                "in_width" = "out_width" * "stride"
            ],
            &input,
            &["batch", "out_height", "out_width"],
            &[("in_planes", self.in_planes()), ("stride", self.stride())],
        );

        let identity = self.shortcut(input.clone());

        let x = self.cna1.forward(input);
        let x = self.cna2.forward(x);
        let x = self.cna3.hook_forward(x, |x| x + identity);

        assert_shape_contract_periodically!(
            ["batch", "out_planes", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_planes", self.out_planes()),
                ("out_height", out_height),
                ("out_width", out_width)
            ]
        );

        x
    }
}
