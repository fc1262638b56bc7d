//! Core cloud detection modules

pub mod resample;
pub mod assemble;
pub mod normalize;
pub mod ensemble;
pub mod threshold;
pub mod pipeline;

// Re-export main types
pub use resample::Resampler;
pub use assemble::{AssemblyParams, ProductAssembler};
pub use normalize::{clip, clip_bytes, normalize, normalize_bytes, to_interleaved, OutputScale};
pub use ensemble::{EnsembleConfig, InferenceEnsemble, InferenceOutput, InferenceParams, Regressor};
pub use threshold::{
    classify, decide, finite_range, majority_filter, ThresholdParams, Thresholder, CLOUDY_FRACTION_PERCENT,
};
pub use pipeline::{CloudReport, CloudRequest, Orchestrator, PipelineParams, ReportSink};
