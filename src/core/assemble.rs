use crate::core::resample::Resampler;
use crate::types::{
    BandName, BandSet, CloudError, CloudResult, ExecutionMode, Product, Raster, ResampleKernel,
    ScalingMode, Shape,
};
use ndarray::{Array3, Axis};
use std::borrow::Cow;

/// Parameters for product assembly
#[derive(Debug, Clone)]
pub struct AssemblyParams {
    pub scaling: ScalingMode,
    pub kernel: ResampleKernel,
    pub execution: ExecutionMode,
}

impl Default for AssemblyParams {
    fn default() -> Self {
        Self {
            scaling: ScalingMode::Downsize,
            kernel: ResampleKernel::Lanczos3,
            execution: ExecutionMode::Parallel,
        }
    }
}

/// Builds aligned multi-band products from heterogeneous band sets
pub struct ProductAssembler {
    params: AssemblyParams,
}

impl ProductAssembler {
    pub fn new(params: AssemblyParams) -> Self {
        Self { params }
    }

    pub fn with_scaling(scaling: ScalingMode) -> Self {
        Self::new(AssemblyParams {
            scaling,
            ..AssemblyParams::default()
        })
    }

    /// Common grid for the requested shapes
    ///
    /// Shapes compare as (rows, cols) tuples: rows decide, cols break ties.
    pub fn target_shape(shapes: &[Shape], scaling: ScalingMode) -> Option<Shape> {
        match scaling {
            ScalingMode::Downsize => shapes.iter().copied().min(),
            ScalingMode::Upsize => shapes.iter().copied().max(),
        }
    }

    /// Stack `band_names` from `bandset` on a common grid, in list order
    pub fn assemble(&self, bandset: &BandSet, band_names: &[BandName]) -> CloudResult<Product> {
        if band_names.is_empty() {
            return Err(CloudError::InvalidConfiguration(
                "Band list must not be empty".to_string(),
            ));
        }

        let rasters = band_names
            .iter()
            .map(|name| {
                bandset
                    .get(name)
                    .map(|band| &band.data)
                    .ok_or_else(|| CloudError::MissingBand(name.to_string()))
            })
            .collect::<CloudResult<Vec<&Raster>>>()?;

        let shapes: Vec<Shape> = rasters.iter().map(|r| r.dim()).collect();
        let target = Self::target_shape(&shapes, self.params.scaling).ok_or_else(|| {
            CloudError::InvalidConfiguration("No bands to assemble".to_string())
        })?;

        log::info!(
            "Assembling {} bands with {:?} to {}x{}",
            band_names.len(),
            self.params.scaling,
            target.0,
            target.1
        );
        log::debug!("Requested band shapes: {:?}", shapes);

        let resampler = Resampler::new(self.params.kernel);
        let aligned = self.resample_all(&resampler, &rasters, target)?;

        let mut data = Array3::<f32>::zeros((band_names.len(), target.0, target.1));
        for (channel, (raster, name)) in aligned.iter().zip(band_names).enumerate() {
            if raster.dim() != target {
                return Err(CloudError::ShapeMismatch(format!(
                    "Band {} resampled to {:?}, expected {:?}",
                    name,
                    raster.dim(),
                    target
                )));
            }
            data.index_axis_mut(Axis(0), channel).assign(&**raster);
        }

        Product::new(band_names.to_vec(), data)
    }

    fn resample_all<'a>(
        &self,
        resampler: &Resampler,
        rasters: &[&'a Raster],
        target: Shape,
    ) -> CloudResult<Vec<Cow<'a, Raster>>> {
        #[cfg(feature = "parallel")]
        {
            if self.params.execution.is_parallel() {
                use rayon::prelude::*;

                return rasters
                    .par_iter()
                    .map(|&raster| resampler.resample(raster, target))
                    .collect();
            }
        }

        rasters
            .iter()
            .map(|&raster| resampler.resample(raster, target))
            .collect()
    }
}

impl Default for ProductAssembler {
    fn default() -> Self {
        Self::new(AssemblyParams::default())
    }
}
