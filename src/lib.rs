//! cloudmask: ensemble cloud-cover detection for Sentinel-2 imagery
//!
//! Bands of differing native resolution are aligned onto a common grid, an
//! ensemble of pretrained regressors estimates per-pixel cloud optical
//! thickness, and the thresholded masks yield a cloudy / not-cloudy decision
//! for a requested date and area.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use crate::types::{
    Band, BandName, BandSet, BinaryMask, CloudDecision, CloudError, CloudResult, Collection,
    ExecutionMode, GeoBox, PredictionMap, Product, Raster, ResampleKernel, ScalingMode,
};

pub use crate::core::{
    CloudReport, CloudRequest, EnsembleConfig, InferenceEnsemble, Orchestrator, PipelineParams,
    ProductAssembler, Regressor, Resampler, Thresholder,
};
pub use crate::io::{BandSource, CancelHandle, JsonModelRepository, ModelRepository};
