//! # `ResNet` Utilities
use bimm_contracts::unpack_shape_contract;
use burn::nn::Initializer;

/// Kaiming normal initializer for conv layers feeding a `ReLU`.
///
/// Matches the upstream `ResNet` ``fan_out`` / ``relu`` initialization.
pub static CONV_INTO_RELU_INITIALIZER: Initializer = Initializer::KaimingNormal {
    gain: std::f64::consts::SQRT_2,
    fan_out_only: true,
};

/// Broadcast a scalar to a 2d array.
#[inline(always)]
pub fn scalar_to_array(value: usize) -> [usize; 2] {
    [value, value]
}

/// Get the output resolution for a given input resolution.
///
/// The input must be a multiple of the stride.
///
/// # Arguments
///
/// - `input_resolution`: ``[height_in=height_out*stride, width_in=width_out*stride]``.
///
/// # Returns
///
/// ``[height_out, width_out]``
///
/// # Panics
///
/// If the input resolution is not a multiple of the stride.
#[inline(always)]
pub fn stride_div_output_resolution(
    input_resolution: [usize; 2],
    stride: usize,
) -> [usize; 2] {
    unpack_shape_contract!(
        [
            "height_in" = "height_out" * "stride",
            "width_in" = "width_out" * "stride"
        ],
        &input_resolution,
        &["height_out", "width_out"],
        &[("stride", stride)]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_div_output_resolution() {
        assert_eq!(stride_div_output_resolution([32, 32], 1), [32, 32]);
        assert_eq!(stride_div_output_resolution([32, 16], 2), [16, 8]);
    }

    #[test]
    #[should_panic(expected = "7 !~ height_in=(height_out*stride)")]
    fn test_stride_div_output_resolution_panic() {
        stride_div_output_resolution([7, 8], 2);
    }
}
