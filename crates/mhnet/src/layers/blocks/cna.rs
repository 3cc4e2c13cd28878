//! # `CNA2d` - conv/norm/activation block.
//!
//! A [`CNA2d`] module is:
//! * a [`Conv2d`] layer,
//! * a [`BatchNorm`] layer,
//! * a [`Relu`] layer.
//!
//! With support for hooking the forward method,
//! to run code between the norm and activation layers.

use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Relu};
use burn::prelude::{Backend, Tensor};

/// [`CNA2d`] Meta.
pub trait CNA2dMeta {
    /// Number of input channels.
    fn in_channels(&self) -> usize;

    /// Number of output channels.
    fn out_channels(&self) -> usize;

    /// Get the stride.
    fn stride(&self) -> [usize; 2];
}

/// [`CNA2d`] Config.
///
/// Implements [`CNA2dMeta`].
#[derive(Config, Debug)]
pub struct CNA2dConfig {
    /// The [`Conv2d`] config.
    pub conv: Conv2dConfig,
}

impl From<Conv2dConfig> for CNA2dConfig {
    fn from(conv: Conv2dConfig) -> Self {
        Self { conv }
    }
}

impl CNA2dMeta for CNA2dConfig {
    fn in_channels(&self) -> usize {
        self.conv.channels[0]
    }

    fn out_channels(&self) -> usize {
        self.conv.channels[1]
    }

    fn stride(&self) -> [usize; 2] {
        self.conv.stride
    }
}

impl CNA2dConfig {
    /// Override the conv initializer.
    pub fn with_initializer(
        self,
        initializer: Initializer,
    ) -> Self {
        Self {
            conv: self.conv.with_initializer(initializer),
        }
    }

    /// Initialize a [`CNA2d`].
    ///
    /// The norm layer is sized to the conv output channels.
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> CNA2d<B> {
        CNA2d {
            norm: BatchNormConfig::new(self.out_channels()).init(device),
            conv: self.conv.init(device),
            act: Relu::new(),
        }
    }
}

/// Sequenced conv/norm/activation block.
///
/// Implements [`CNA2dMeta`].
#[derive(Module, Debug)]
pub struct CNA2d<B: Backend> {
    /// Internal Conv2d layer.
    pub conv: Conv2d<B>,

    /// Internal Norm Layer.
    pub norm: BatchNorm<B, 2>,

    /// Activation layer.
    pub act: Relu,
}

impl<B: Backend> CNA2dMeta for CNA2d<B> {
    fn in_channels(&self) -> usize {
        self.conv.weight.shape().dims[1] * self.conv.groups
    }

    fn out_channels(&self) -> usize {
        self.conv.weight.shape().dims[0]
    }

    fn stride(&self) -> [usize; 2] {
        self.conv.stride
    }
}

impl<B: Backend> CNA2d<B> {
    /// Forward Pass.
    ///
    /// Applies the conv/norm/act layers in sequence.
    ///
    /// # Arguments
    ///
    /// - `input`: \
    ///   ``[batch, in_channels, in_height=out_height*stride, in_width=out_width*stride]``.
    ///
    /// # Returns
    ///
    /// ``[batch, out_channels, out_height, out_width]``
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        self.hook_forward(input, |x| x)
    }

    /// Hooked Forward Pass.
    ///
    /// Applies the hook after normalization but before activation.
    ///
    /// ```rust,ignore
    /// let x = self.conv.forward(input);
    /// let x = self.norm.forward(x);
    /// let x = hook(x);
    /// let x = self.act.forward(x);
    /// return x
    /// ```
    pub fn hook_forward<F>(
        &self,
        input: Tensor<B, 4>,
        hook: F,
    ) -> Tensor<B, 4>
    where
        F: FnOnce(Tensor<B, 4>) -> Tensor<B, 4>,
    {
        let [batch, out_height, out_width] = unpack_shape_contract!(
            [
                "batch",
                "in_channels",
                "in_height" = "out_height" * "height_stride",
                "in_width" = "out_width" * "width_stride"
            ],
            &input,
            &["batch", "out_height", "out_width"],
            &[
                ("in_channels", self.in_channels()),
                ("height_stride", self.stride()[0]),
                ("width_stride", self.stride()[1]),
            ]
        );
        let x = self.conv.forward(input);

        assert_shape_contract_periodically!(
            ["batch", "out_channels", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_channels", self.out_channels()),
                ("out_height", out_height),
                ("out_width", out_width)
            ]
        );

        let x = self.norm.forward(x);

        let x = hook(x);

        self.act.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;
    use burn::nn::PaddingConfig2d;
    use burn::tensor::Distribution;

    #[test]
    fn test_cna_config() {
        let config: CNA2dConfig = Conv2dConfig::new([2, 4], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .into();

        assert_eq!(config.in_channels(), 2);
        assert_eq!(config.out_channels(), 4);
        assert_eq!(config.stride(), [2, 2]);
    }

    #[test]
    fn test_cna_forward_is_non_negative() {
        type B = NdArray;
        let device = Default::default();

        let cna: CNA2d<B> = CNA2dConfig::from(
            Conv2dConfig::new([2, 4], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false),
        )
        .init(&device);

        let input = Tensor::random([2, 2, 6, 6], Distribution::Normal(0.0, 1.0), &device);
        let output = cna.forward(input);

        assert_shape_contract!(
            ["batch", "out_channels", "out_height", "out_width"],
            &output,
            &[
                ("batch", 2),
                ("out_channels", 4),
                ("out_height", 6),
                ("out_width", 6)
            ],
        );

        let min = output.min().into_scalar();
        assert!(min >= 0.0);
    }

    #[test]
    fn test_cna_hook_runs_before_activation() {
        type B = NdArray;
        let device = Default::default();

        let cna: CNA2d<B> = CNA2dConfig::from(Conv2dConfig::new([1, 1], [1, 1]).with_bias(false))
            .init(&device);

        let input: Tensor<B, 4> = Tensor::ones([1, 1, 2, 2], &device);

        // Pushing everything far below zero must be clipped by the activation.
        let output = cna.hook_forward(input, |x| x - 1.0e6);
        output
            .to_data()
            .assert_eq(&Tensor::<B, 4>::zeros([1, 1, 2, 2], &device).to_data(), true);
    }
}
