//! # Classification Head Bank
//!
//! A [`HeadBank`] fans a shared feature vector out into 2 to 4 independent
//! linear classifiers, one per predicted attribute, each followed by
//! `log_softmax` over its own label space.
//!
//! Heads are always ordered ``number, color, [location], [scale]``.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::log_softmax;

/// Fewest heads a bank may hold.
pub const MIN_HEADS: usize = 2;

/// Most heads a bank may hold.
pub const MAX_HEADS: usize = 4;

/// Head names, in output order.
pub const HEAD_NAMES: [&str; MAX_HEADS] = ["number", "color", "location", "scale"];

/// [`HeadBank`] Config.
#[derive(Config, Debug)]
pub struct HeadBankConfig {
    /// Width of the shared input feature.
    pub in_features: usize,

    /// Label count of each head, in head order.
    pub classes: Vec<usize>,
}

impl HeadBankConfig {
    /// The number of heads.
    pub fn num_heads(&self) -> usize {
        self.classes.len()
    }

    /// Check if the config is valid.
    ///
    /// # Returns
    ///
    /// A `Result<(), String>`
    pub fn try_validate(&self) -> Result<(), String> {
        let heads = self.num_heads();
        if !(MIN_HEADS..=MAX_HEADS).contains(&heads) {
            return Err(format!(
                "expected {MIN_HEADS}..={MAX_HEADS} heads, found {heads}: {:?}",
                self.classes
            ));
        }
        if self.in_features == 0 {
            return Err("in_features is zero".to_string());
        }
        if let Some(idx) = self.classes.iter().position(|&c| c == 0) {
            return Err(format!("head {} ({}) has no classes", idx, HEAD_NAMES[idx]));
        }
        Ok(())
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        match self.try_validate() {
            Ok(_) => (),
            Err(err) => panic!("{}", err),
        }
    }

    /// Initialize a [`HeadBank`].
    ///
    /// # Panics
    ///
    /// If the config is not valid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> HeadBank<B> {
        self.expect_valid();

        let head = |idx: usize| -> Option<Linear<B>> {
            self.classes
                .get(idx)
                .map(|&classes| LinearConfig::new(self.in_features, classes).init(device))
        };

        HeadBank {
            number: LinearConfig::new(self.in_features, self.classes[0]).init(device),
            color: LinearConfig::new(self.in_features, self.classes[1]).init(device),
            location: head(2),
            scale: head(3),
        }
    }
}

/// A bank of 2 to 4 linear + `log_softmax` classifiers.
#[derive(Module, Debug)]
pub struct HeadBank<B: Backend> {
    /// The "number" head.
    pub number: Linear<B>,

    /// The "color" head.
    pub color: Linear<B>,

    /// The optional third "location" head.
    pub location: Option<Linear<B>>,

    /// The optional fourth "scale" head.
    pub scale: Option<Linear<B>>,
}

impl<B: Backend> HeadBank<B> {
    /// The number of heads.
    pub fn num_heads(&self) -> usize {
        MIN_HEADS + self.location.is_some() as usize + self.scale.is_some() as usize
    }

    /// Shared input width.
    pub fn in_features(&self) -> usize {
        self.number.weight.dims()[0]
    }

    /// Label count of each head, in head order.
    pub fn classes(&self) -> Vec<usize> {
        [Some(&self.number), Some(&self.color), self.location.as_ref(), self.scale.as_ref()]
            .into_iter()
            .flatten()
            .map(|linear| linear.weight.dims()[1])
            .collect()
    }

    /// Apply every head to the shared feature.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_features]``.
    ///
    /// # Returns
    ///
    /// One ``[batch, classes_i]`` log-probability tensor per head.
    pub fn forward(
        &self,
        input: Tensor<B, 2>,
    ) -> HeadOutputs<B> {
        let apply = |linear: &Linear<B>, x: Tensor<B, 2>| log_softmax(linear.forward(x), 1);

        HeadOutputs {
            number: apply(&self.number, input.clone()),
            color: apply(&self.color, input.clone()),
            location: self
                .location
                .as_ref()
                .map(|linear| apply(linear, input.clone())),
            scale: self.scale.as_ref().map(|linear| apply(linear, input)),
        }
    }
}

/// Per-head log-probabilities.
#[derive(Debug, Clone)]
pub struct HeadOutputs<B: Backend> {
    /// ``[batch, number_classes]``
    pub number: Tensor<B, 2>,

    /// ``[batch, color_classes]``
    pub color: Tensor<B, 2>,

    /// ``[batch, location_classes]``, on 3 and 4 head models.
    pub location: Option<Tensor<B, 2>>,

    /// ``[batch, scale_classes]``, on 4 head models.
    pub scale: Option<Tensor<B, 2>>,
}

impl<B: Backend> HeadOutputs<B> {
    /// The number of outputs.
    pub fn len(&self) -> usize {
        MIN_HEADS + self.location.is_some() as usize + self.scale.is_some() as usize
    }

    /// Always false; a bank has at least two heads.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The outputs, in head order.
    pub fn into_vec(self) -> Vec<Tensor<B, 2>> {
        [Some(self.number), Some(self.color), self.location, self.scale]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use hamcrest::prelude::*;

    #[test]
    fn test_head_bank_config_validate() {
        assert!(HeadBankConfig::new(8, vec![10, 10]).try_validate().is_ok());
        assert!(HeadBankConfig::new(8, vec![10, 10, 9, 2]).try_validate().is_ok());

        let err = HeadBankConfig::new(8, vec![10]).try_validate().unwrap_err();
        assert!(err.starts_with("expected 2..=4 heads, found 1"));

        let err = HeadBankConfig::new(8, vec![1, 2, 3, 4, 5])
            .try_validate()
            .unwrap_err();
        assert!(err.starts_with("expected 2..=4 heads, found 5"));

        let err = HeadBankConfig::new(8, vec![10, 10, 0])
            .try_validate()
            .unwrap_err();
        assert_eq!(err, "head 2 (location) has no classes");
    }

    #[test]
    #[should_panic(expected = "expected 2..=4 heads")]
    fn test_head_bank_init_invalid() {
        type B = NdArray;
        let device = Default::default();
        let _bank: HeadBank<B> = HeadBankConfig::new(8, vec![3]).init(&device);
    }

    #[test]
    fn test_head_bank_forward() {
        type B = NdArray;
        let device = Default::default();

        let batch = 3;
        let in_features = 16;

        for classes in [vec![10, 10], vec![10, 10, 9], vec![10, 10, 9, 2]] {
            let bank: HeadBank<B> = HeadBankConfig::new(in_features, classes.clone()).init(&device);
            assert_eq!(bank.num_heads(), classes.len());
            assert_eq!(bank.in_features(), in_features);
            assert_eq!(bank.classes(), classes);

            let input = Tensor::random([batch, in_features], Distribution::Default, &device);
            let outputs = bank.forward(input);
            assert_eq!(outputs.len(), classes.len());

            let outputs = outputs.into_vec();
            assert_eq!(outputs.len(), classes.len());

            for (output, &num_classes) in outputs.into_iter().zip(classes.iter()) {
                assert_eq!(output.dims(), [batch, num_classes]);

                let sums = output.exp().sum_dim(1).to_data().to_vec::<f32>().unwrap();
                for total in sums {
                    assert_that!(total as f64, close_to(1.0, 1e-4));
                }
            }
        }
    }
}
