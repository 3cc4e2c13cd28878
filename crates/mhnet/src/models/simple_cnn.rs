//! # Simple CNN
//!
//! A shallow two-convolution baseline with the same multi-head output
//! convention as [`crate::models::resnet::MultiHeadResNet`]:
//!
//! ```text
//! conv5x5(3 -> 20) -> relu -> maxpool2
//!   -> conv5x5(20 -> 50) -> relu -> maxpool2
//!   -> flatten(1250) -> linear(500) -> relu -> [number, color, location?]
//! ```
//!
//! The fixed fan-in of the dense layer requires 32x32 input images.

use crate::layers::heads::{HeadBank, HeadBankConfig, HeadOutputs};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::relu;

/// The model name.
pub const SIMPLE_CNN_NAME: &str = "simple_cnn";

/// Input image edge.
pub const SIMPLE_CNN_RESOLUTION: usize = 32;

const CONV1_CHANNELS: usize = 20;
const CONV2_CHANNELS: usize = 50;
const KERNEL: usize = 5;
const POOLED_EDGE: usize = 5;
const FLAT_FEATURES: usize = POOLED_EDGE * POOLED_EDGE * CONV2_CHANNELS;
const HIDDEN_FEATURES: usize = 500;
const MAX_HEADS: usize = 3;

/// [`SimpleCnn`] Config.
#[derive(Config, Debug)]
pub struct SimpleCnnConfig {
    /// Label count of each head; 2 or 3 heads.
    #[config(default = "vec![10, 10]")]
    pub classes: Vec<usize>,
}

impl SimpleCnnConfig {
    /// The [`HeadBank`] config.
    pub fn head_config(&self) -> HeadBankConfig {
        HeadBankConfig::new(HIDDEN_FEATURES, self.classes.clone())
    }

    /// Check if the config is valid.
    ///
    /// # Returns
    ///
    /// A `Result<(), String>`
    pub fn try_validate(&self) -> Result<(), String> {
        if self.classes.len() > MAX_HEADS {
            return Err(format!(
                "simple_cnn supports at most {MAX_HEADS} heads, found {}",
                self.classes.len()
            ));
        }
        self.head_config().try_validate()
    }

    /// Initialize a [`SimpleCnn`].
    ///
    /// # Panics
    ///
    /// If the config is not valid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> SimpleCnn<B> {
        if let Err(err) = self.try_validate() {
            panic!("{}", err);
        }

        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]);

        SimpleCnn {
            conv1: Conv2dConfig::new([3, CONV1_CHANNELS], [KERNEL, KERNEL]).init(device),
            conv2: Conv2dConfig::new([CONV1_CHANNELS, CONV2_CHANNELS], [KERNEL, KERNEL])
                .init(device),
            pool: pool.init(),
            fc1: LinearConfig::new(FLAT_FEATURES, HIDDEN_FEATURES).init(device),
            heads: self.head_config().init(device),
            name: Ignored(SIMPLE_CNN_NAME.to_string()),
        }
    }
}

/// Two-conv multi-head baseline.
#[derive(Module, Debug)]
pub struct SimpleCnn<B: Backend> {
    /// ``3 -> 20``, 5x5.
    pub conv1: Conv2d<B>,

    /// ``20 -> 50``, 5x5.
    pub conv2: Conv2d<B>,

    /// Shared 2x2 max pool.
    pub pool: MaxPool2d,

    /// ``1250 -> 500``.
    pub fc1: Linear<B>,

    /// The classification heads.
    pub heads: HeadBank<B>,

    /// Informational model name.
    pub name: Ignored<String>,
}

impl<B: Backend> SimpleCnn<B> {
    /// The model name.
    pub fn name(&self) -> &str {
        &self.name.0
    }

    /// The number of heads.
    pub fn num_heads(&self) -> usize {
        self.heads.num_heads()
    }

    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, 3, 32, 32]``.
    ///
    /// # Returns
    ///
    /// One ``[batch, classes_i]`` log-probability tensor per head.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> HeadOutputs<B> {
        let [batch] = unpack_shape_contract!(
            ["batch", "channels", "height", "width"],
            &input,
            &["batch"],
            &[
                ("channels", 3),
                ("height", SIMPLE_CNN_RESOLUTION),
                ("width", SIMPLE_CNN_RESOLUTION)
            ],
        );

        let x = self.pool.forward(relu(self.conv1.forward(input)));
        let x = self.pool.forward(relu(self.conv2.forward(x)));

        assert_shape_contract_periodically!(
            ["batch", "channels", "height", "width"],
            &x,
            &[
                ("batch", batch),
                ("channels", CONV2_CHANNELS),
                ("height", POOLED_EDGE),
                ("width", POOLED_EDGE)
            ],
        );

        let x: Tensor<B, 2> = x.flatten(1, 3);
        let x = relu(self.fc1.forward(x));

        self.heads.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use hamcrest::prelude::*;

    #[test]
    fn test_config_validate() {
        assert!(SimpleCnnConfig::new().try_validate().is_ok());
        assert!(
            SimpleCnnConfig::new()
                .with_classes(vec![10, 10, 9])
                .try_validate()
                .is_ok()
        );
        assert_eq!(
            SimpleCnnConfig::new()
                .with_classes(vec![10, 10, 9, 2])
                .try_validate(),
            Err("simple_cnn supports at most 3 heads, found 4".to_string())
        );
        assert!(
            SimpleCnnConfig::new()
                .with_classes(vec![10])
                .try_validate()
                .is_err()
        );
    }

    #[test]
    #[should_panic(expected = "at most 3 heads")]
    fn test_init_rejects_four_heads() {
        type B = NdArray;
        let device = Default::default();
        let _model: SimpleCnn<B> = SimpleCnnConfig::new()
            .with_classes(vec![1, 2, 3, 4])
            .init(&device);
    }

    #[test]
    fn test_forward() {
        type B = NdArray;
        let device = Default::default();
        let batch = 2;

        for classes in [vec![10, 10], vec![10, 10, 9]] {
            let model: SimpleCnn<B> = SimpleCnnConfig::new()
                .with_classes(classes.clone())
                .init(&device);
            assert_eq!(model.name(), "simple_cnn");
            assert_eq!(model.num_heads(), classes.len());

            let input = Tensor::random([batch, 3, 32, 32], Distribution::Default, &device);
            let outputs = model.forward(input).into_vec();
            assert_eq!(outputs.len(), classes.len());

            for (output, &num_classes) in outputs.into_iter().zip(classes.iter()) {
                assert_eq!(output.dims(), [batch, num_classes]);
                for total in output.exp().sum_dim(1).to_data().to_vec::<f32>().unwrap() {
                    assert_that!(total as f64, close_to(1.0, 1e-4));
                }
            }
        }
    }

    #[test]
    #[should_panic]
    fn test_forward_wrong_resolution() {
        type B = NdArray;
        let device = Default::default();

        let model: SimpleCnn<B> = SimpleCnnConfig::new().init(&device);
        let input = Tensor::ones([1, 3, 28, 28], &device);
        let _ = model.forward(input);
    }
}
