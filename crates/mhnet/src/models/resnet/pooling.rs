//! # Trunk Feature Pooling
//!
//! [`FeaturePool`] reduces the trunk's final feature map to the head input
//! vector, either by spatial average pooling or by a dense projection of the
//! flattened map.

use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::relu;

/// Average-pool window for 4-head models.
pub const FOUR_HEAD_POOL_WINDOW: usize = 12;

/// Average-pool window for 2 and 3 head models.
pub const POOL_WINDOW: usize = 4;

/// Fixed fan-in of the projection pool.
///
/// Matches ``512 * 4 * 4``; a basic-block trunk on 32x32 images.
pub const PROJECTION_FAN_IN: usize = 8192;

/// The average-pool window for a model with `num_heads` heads.
pub fn pool_window(num_heads: usize) -> usize {
    if num_heads == 4 {
        FOUR_HEAD_POOL_WINDOW
    } else {
        POOL_WINDOW
    }
}

/// [`FeaturePool`] Config.
#[derive(Config, Debug)]
pub struct FeaturePoolConfig {
    /// Width of the trunk output, and of the pooled feature.
    pub features: usize,

    /// The number of heads; selects the average-pool window.
    pub num_heads: usize,

    /// Average pool when true; dense projection when false.
    #[config(default = true)]
    pub pool: bool,
}

impl FeaturePoolConfig {
    /// Initialize a [`FeaturePool`].
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> FeaturePool<B> {
        if self.pool {
            let window = pool_window(self.num_heads);
            FeaturePool::Average(SpatialAveragePool {
                pool: AvgPool2dConfig::new([window, window])
                    .with_strides([window, window])
                    .init(),
                window,
            })
        } else {
            FeaturePool::Projection(
                LinearConfig::new(PROJECTION_FAN_IN, self.features).init(device),
            )
        }
    }
}

/// Fixed-window average pool over the whole final map.
#[derive(Module, Clone, Debug)]
pub struct SpatialAveragePool {
    /// The pooling layer.
    pub pool: AvgPool2d,

    /// Window edge; the final map must be exactly ``window x window``.
    pub window: usize,
}

impl SpatialAveragePool {
    /// Pool, activate, and flatten.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, channels, window, window]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, channels]`` tensor.
    pub fn forward<B: Backend>(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        let [batch, channels] = unpack_shape_contract!(
            ["batch", "channels", "height", "width"],
            &input,
            &["batch", "channels"],
            &[("height", self.window), ("width", self.window)],
        );

        let x = relu(self.pool.forward(input));
        let x: Tensor<B, 2> = x.flatten(1, 3);

        assert_shape_contract_periodically!(
            ["batch", "channels"],
            &x,
            &[("batch", batch), ("channels", channels)],
        );

        x
    }
}

/// Trunk to head feature reduction.
#[derive(Module, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum FeaturePool<B: Backend> {
    /// Average-pool to 1x1, then ReLU.
    Average(SpatialAveragePool),

    /// Flatten, project ``PROJECTION_FAN_IN -> features``, then ReLU.
    Projection(Linear<B>),
}

impl<B: Backend> FeaturePool<B> {
    /// Is this the average-pool variant?
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Average(_))
    }

    /// Reduce the final feature map to the head input.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, channels, height, width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, features]`` tensor.
    ///
    /// # Panics
    ///
    /// On the average path, if ``height`` or ``width`` differ from the window;
    /// on the projection path, if ``channels * height * width != PROJECTION_FAN_IN``.
    #[tracing::instrument(skip_all)]
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        match self {
            Self::Average(pool) => pool.forward(input),
            Self::Projection(linear) => {
                let x: Tensor<B, 2> = input.flatten(1, 3);
                let [batch] = unpack_shape_contract!(
                    ["batch", "features"],
                    &x,
                    &["batch"],
                    &[("features", PROJECTION_FAN_IN)],
                );

                let x = relu(linear.forward(x));

                assert_shape_contract_periodically!(
                    ["batch", "features"],
                    &x,
                    &[("batch", batch), ("features", linear.weight.dims()[1])],
                );

                x
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_pool_window() {
        assert_eq!(pool_window(2), 4);
        assert_eq!(pool_window(3), 4);
        assert_eq!(pool_window(4), 12);
    }

    #[test]
    fn test_average_pool() {
        type B = NdArray;
        let device = Default::default();

        let pool: FeaturePool<B> = FeaturePoolConfig::new(8, 2).init(&device);
        assert!(pool.is_pooled());

        let input = Tensor::ones([2, 8, 4, 4], &device);
        let output = pool.forward(input);
        assert_eq!(output.dims(), [2, 8]);
        output
            .to_data()
            .assert_eq(&Tensor::<B, 2>::ones([2, 8], &device).to_data(), true);

        let pool: FeaturePool<B> = FeaturePoolConfig::new(8, 4).init(&device);
        let input = Tensor::random([1, 8, 12, 12], Distribution::Default, &device);
        assert_eq!(pool.forward(input).dims(), [1, 8]);
    }

    #[test]
    fn test_average_pool_is_activated() {
        type B = NdArray;
        let device = Default::default();

        let pool: FeaturePool<B> = FeaturePoolConfig::new(3, 3).init(&device);
        let input = Tensor::<B, 4>::ones([1, 3, 4, 4], &device).neg();
        let output = pool.forward(input);
        output
            .to_data()
            .assert_eq(&Tensor::<B, 2>::zeros([1, 3], &device).to_data(), true);
    }

    #[test]
    #[should_panic]
    fn test_average_pool_wrong_resolution() {
        type B = NdArray;
        let device = Default::default();

        // A 4-head model expects a 12x12 map.
        let pool: FeaturePool<B> = FeaturePoolConfig::new(8, 4).init(&device);
        let input = Tensor::ones([1, 8, 4, 4], &device);
        let _ = pool.forward(input);
    }

    #[test]
    fn test_projection_pool() {
        type B = NdArray;
        let device = Default::default();

        let pool: FeaturePool<B> = FeaturePoolConfig::new(512, 2)
            .with_pool(false)
            .init(&device);
        assert!(!pool.is_pooled());

        let input = Tensor::random([2, 512, 4, 4], Distribution::Default, &device);
        let output = pool.forward(input);
        assert_eq!(output.dims(), [2, 512]);
        assert!(output.min().into_scalar() >= 0.0);
    }

    #[test]
    #[should_panic]
    fn test_projection_pool_wrong_fan_in() {
        type B = NdArray;
        let device = Default::default();

        let pool: FeaturePool<B> = FeaturePoolConfig::new(16, 2)
            .with_pool(false)
            .init(&device);
        let input = Tensor::ones([1, 16, 4, 4], &device);
        let _ = pool.forward(input);
    }
}
