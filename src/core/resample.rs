use crate::types::{CloudError, CloudResult, Raster, ResampleKernel, Shape};
use ndarray::Array2;
use std::borrow::Cow;
use std::f64::consts::PI;

impl ResampleKernel {
    /// Kernel half-width in source pixels at unit scale
    fn support(&self) -> f64 {
        match self {
            ResampleKernel::Nearest => 0.0,
            ResampleKernel::Box => 0.5,
            ResampleKernel::Bilinear => 1.0,
            ResampleKernel::Lanczos3 => 3.0,
        }
    }

    fn weight(&self, x: f64) -> f64 {
        match self {
            ResampleKernel::Nearest => 0.0,
            ResampleKernel::Box => {
                if (-0.5..0.5).contains(&x) {
                    1.0
                } else {
                    0.0
                }
            }
            ResampleKernel::Bilinear => {
                let x = x.abs();
                if x < 1.0 {
                    1.0 - x
                } else {
                    0.0
                }
            }
            ResampleKernel::Lanczos3 => {
                if x.abs() < 3.0 {
                    sinc(x) * sinc(x / 3.0)
                } else {
                    0.0
                }
            }
        }
    }
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

/// Contributing source taps for every output index along one axis
struct AxisTaps {
    start: Vec<usize>,
    weights: Vec<Vec<f64>>,
}

impl AxisTaps {
    fn compute(kernel: ResampleKernel, in_size: usize, out_size: usize) -> Self {
        let scale = in_size as f64 / out_size as f64;
        let mut start = Vec::with_capacity(out_size);
        let mut weights = Vec::with_capacity(out_size);

        if kernel == ResampleKernel::Nearest {
            for i in 0..out_size {
                let src = (((i as f64 + 0.5) * scale) as usize).min(in_size - 1);
                start.push(src);
                weights.push(vec![1.0]);
            }
            return Self { start, weights };
        }

        // Shrinking widens the kernel so every source pixel contributes
        let filter_scale = scale.max(1.0);
        let support = kernel.support() * filter_scale;
        let inv_filter_scale = 1.0 / filter_scale;

        for i in 0..out_size {
            let center = (i as f64 + 0.5) * scale;
            let xmin = ((center - support + 0.5).floor().max(0.0)) as usize;
            let xmax = ((center + support + 0.5).floor() as usize).min(in_size);

            let mut taps: Vec<f64> = (xmin..xmax)
                .map(|x| kernel.weight((x as f64 - center + 0.5) * inv_filter_scale))
                .collect();
            let total: f64 = taps.iter().sum();
            if total != 0.0 {
                for w in taps.iter_mut() {
                    *w /= total;
                }
            } else {
                // Degenerate window, fall back to the closest source pixel
                taps = vec![0.0; xmax.saturating_sub(xmin)];
                let nearest = (center as usize).clamp(xmin, xmax.saturating_sub(1));
                if let Some(w) = taps.get_mut(nearest - xmin) {
                    *w = 1.0;
                }
            }

            start.push(xmin);
            weights.push(taps);
        }

        Self { start, weights }
    }

    fn apply(&self, out: usize, line: impl Fn(usize) -> f32) -> f32 {
        let mut acc = 0.0f64;
        for (k, &w) in self.weights[out].iter().enumerate() {
            if w != 0.0 {
                acc += w * line(self.start[out] + k) as f64;
            }
        }
        acc as f32
    }
}

/// Aligns a single band raster onto a target grid
#[derive(Debug, Clone, Copy, Default)]
pub struct Resampler {
    kernel: ResampleKernel,
}

impl Resampler {
    pub fn new(kernel: ResampleKernel) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> ResampleKernel {
        self.kernel
    }

    /// Resample `raster` to exactly `target` (rows, cols)
    ///
    /// A raster already at the target shape is returned borrowed, untouched.
    /// Enlarging interpolates with the configured kernel; shrinking runs the
    /// same kernel widened by the reduction ratio, which approaches block
    /// averaging for large ratios. `NaN` inputs propagate to every output
    /// pixel they contribute to.
    pub fn resample<'a>(&self, raster: &'a Raster, target: Shape) -> CloudResult<Cow<'a, Raster>> {
        let (rows, cols) = raster.dim();
        let (out_rows, out_cols) = target;

        if out_rows == 0 || out_cols == 0 {
            return Err(CloudError::InvalidConfiguration(format!(
                "Resample target {}x{} has a zero dimension",
                out_rows, out_cols
            )));
        }
        if rows == 0 || cols == 0 {
            return Err(CloudError::InvalidConfiguration(format!(
                "Cannot resample empty raster {}x{}",
                rows, cols
            )));
        }
        if (rows, cols) == target {
            return Ok(Cow::Borrowed(raster));
        }

        log::debug!(
            "Resampling {}x{} -> {}x{} with {:?}",
            rows, cols, out_rows, out_cols, self.kernel
        );

        let col_taps = AxisTaps::compute(self.kernel, cols, out_cols);
        let row_taps = AxisTaps::compute(self.kernel, rows, out_rows);

        // Horizontal pass
        let mut horizontal = Array2::<f32>::zeros((rows, out_cols));
        for r in 0..rows {
            let line = raster.row(r);
            for c in 0..out_cols {
                horizontal[[r, c]] = col_taps.apply(c, |x| line[x]);
            }
        }

        // Vertical pass
        let mut output = Array2::<f32>::zeros((out_rows, out_cols));
        for c in 0..out_cols {
            let column = horizontal.column(c);
            for r in 0..out_rows {
                output[[r, c]] = row_taps.apply(r, |y| column[y]);
            }
        }

        Ok(Cow::Owned(output))
    }
}
