//! Display scaling for assembled products

use crate::types::{CloudResult, Product};
use ndarray::{Array3, ArrayViewMut2, Axis};
use num_traits::Float;

/// Lower/upper percentile used for contrast stretching
pub const LOWER_PERCENTILE: f64 = 2.0;
pub const UPPER_PERCENTILE: f64 = 98.0;

/// Output value range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputScale {
    /// Floating point in [0, 1]
    Unit,
    /// Integer steps in [0, 255]
    Byte,
}

impl OutputScale {
    fn factor(&self) -> f32 {
        match self {
            OutputScale::Unit => 1.0,
            OutputScale::Byte => 255.0,
        }
    }
}

/// Percentile of an ascending, non-empty slice, interpolating linearly between closest ranks
pub fn percentile<T: Float>(sorted: &[T], p: f64) -> Option<T> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = T::from(rank - lo as f64)?;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

fn stretch_channel(mut channel: ArrayViewMut2<f32>, factor: f32) {
    let mut finite: Vec<f32> = channel.iter().copied().filter(|v| v.is_finite()).collect();
    finite.sort_by(|a, b| a.total_cmp(b));

    let bounds = percentile(&finite, LOWER_PERCENTILE)
        .zip(percentile(&finite, UPPER_PERCENTILE));
    let (low, high) = match bounds {
        Some((low, high)) if high > low => (low, high),
        _ => {
            log::warn!("Flat or empty channel, output set to zero");
            channel.mapv_inplace(|v| if v.is_nan() { v } else { 0.0 });
            return;
        }
    };

    let range = high - low;
    channel.mapv_inplace(|v| {
        if v.is_nan() {
            v
        } else {
            (v.clamp(low, high) - low) / range * factor
        }
    });
}

/// Percentile contrast stretch, per channel
///
/// Every channel is clipped to its 2nd..98th percentile range and mapped
/// linearly onto the output scale. A flat channel (both percentiles equal)
/// becomes all zeros. Invalid pixels stay `NaN`.
pub fn normalize(product: &Product, scale: OutputScale) -> CloudResult<Product> {
    let mut data = product.data().clone();
    let factor = scale.factor();
    for channel in data.axis_iter_mut(Axis(0)) {
        stretch_channel(channel, factor);
    }
    if scale == OutputScale::Byte {
        data.mapv_inplace(|v| v.floor());
    }
    Product::new(product.bands().to_vec(), data)
}

/// Clamp values into [0, 1] and map onto the output scale, without percentiles
pub fn clip(product: &Product, scale: OutputScale) -> CloudResult<Product> {
    let factor = scale.factor();
    let data = product.data().mapv(|v| {
        if v.is_nan() {
            v
        } else {
            let scaled = v.clamp(0.0, 1.0) * factor;
            if scale == OutputScale::Byte {
                scaled.floor()
            } else {
                scaled
            }
        }
    });
    Product::new(product.bands().to_vec(), data)
}

fn to_bytes(data: &Array3<f32>) -> Array3<u8> {
    data.mapv(|v| if v.is_finite() { v.clamp(0.0, 255.0) as u8 } else { 0 })
}

/// Percentile stretch into 8-bit channels; invalid pixels become 0
pub fn normalize_bytes(product: &Product) -> CloudResult<Array3<u8>> {
    Ok(to_bytes(normalize(product, OutputScale::Byte)?.data()))
}

/// Clamp into 8-bit channels; invalid pixels become 0
pub fn clip_bytes(product: &Product) -> CloudResult<Array3<u8>> {
    Ok(to_bytes(clip(product, OutputScale::Byte)?.data()))
}

/// Interleave channels as (rows, cols, channel) for image consumers
pub fn to_interleaved(data: &Array3<f32>) -> Array3<f32> {
    data.view().permuted_axes([1, 2, 0]).as_standard_layout().to_owned()
}
