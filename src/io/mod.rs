//! Band acquisition and model loading collaborators

pub mod band_source;
pub mod model_repository;

pub use band_source::{
    calibrate_digital_numbers, fetch_with_deadline, BandSource, CancelHandle, FetchRequest,
    InMemoryBandSource,
};
pub use model_repository::{
    CollectionDefaults, DenseLayer, EnsembleManifest, JsonModelRepository, MlpRegressor,
    ModelRepository,
};
