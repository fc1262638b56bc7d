use crate::core::assemble::{AssemblyParams, ProductAssembler};
use crate::core::ensemble::{EnsembleConfig, InferenceEnsemble, InferenceParams};
use crate::core::normalize::{normalize, OutputScale};
use crate::core::threshold::decide;
use crate::io::band_source::{fetch_with_deadline, BandSource, CancelHandle, FetchRequest};
use crate::io::model_repository::ModelRepository;
use crate::types::{
    BandName, BinaryMask, CloudDecision, CloudError, CloudResult, Collection, ExecutionMode,
    GeoBox, PredictionMap, Product, ResampleKernel, ScalingMode,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineParams {
    /// Kernel used to reconcile band resolutions
    pub kernel: ResampleKernel,
    /// Majority-vote window applied to the cloud masks (1 = off)
    pub post_filter_size: usize,
    /// Upper bound on band acquisition
    pub fetch_timeout: Duration,
    pub execution: ExecutionMode,
    /// Bands for the display product, leading anchor bands included
    pub display_bands: Vec<BandName>,
    /// Leading display bands that only pin the grid and are dropped afterwards
    pub display_anchor_channels: usize,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            kernel: ResampleKernel::Lanczos3,
            post_filter_size: 1,
            fetch_timeout: Duration::from_secs(120),
            execution: ExecutionMode::Parallel,
            // B09 is 60 m, so Downsize lands on the same grid as the model product
            display_bands: ["B09", "B04", "B03", "B02"]
                .iter()
                .map(|name| BandName::known(name))
                .collect(),
            display_anchor_channels: 1,
        }
    }
}

/// Validated cloud-cover request
#[derive(Debug, Clone, PartialEq)]
pub struct CloudRequest {
    pub date: NaiveDate,
    pub collection: Collection,
    pub area: GeoBox,
}

impl CloudRequest {
    pub fn new(date: NaiveDate, collection: Collection, area: GeoBox) -> CloudResult<Self> {
        area.validate()?;
        Ok(Self { date, collection, area })
    }

    /// Build from a `YYYY-MM-DD` date and a collection name (`l1c` / `l2a`)
    pub fn parse(date: &str, collection: &str, area: GeoBox) -> CloudResult<Self> {
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|e| {
            CloudError::InvalidConfiguration(format!("Invalid date '{}': {}", date, e))
        })?;
        Self::new(date, Collection::parse(collection)?, area)
    }
}

/// Everything one request produces
#[derive(Debug, Clone)]
pub struct CloudReport {
    pub request: CloudRequest,
    pub decision: CloudDecision,
    pub prediction: PredictionMap,
    pub thick: BinaryMask,
    pub thin: BinaryMask,
    /// Percentile-stretched display bands, anchors removed
    pub rgb: Product,
    pub processing_time: Duration,
}

/// Receives finished reports for rendering or storage
pub trait ReportSink {
    fn consume(&self, report: &CloudReport) -> CloudResult<()>;
}

/// Runs fetch, assembly, inference and decision for single requests
pub struct Orchestrator {
    source: Arc<dyn BandSource>,
    ensembles: HashMap<Collection, Arc<EnsembleConfig>>,
    params: PipelineParams,
}

impl Orchestrator {
    pub fn new(source: Arc<dyn BandSource>, params: PipelineParams) -> Self {
        Self {
            source,
            ensembles: HashMap::new(),
            params,
        }
    }

    /// Register a preloaded ensemble for `collection`
    pub fn with_ensemble(mut self, collection: Collection, config: Arc<EnsembleConfig>) -> Self {
        self.ensembles.insert(collection, config);
        self
    }

    /// Load ensembles for `collections` from `repository`
    pub fn with_repository(
        mut self,
        repository: &dyn ModelRepository,
        collections: &[Collection],
    ) -> CloudResult<Self> {
        for &collection in collections {
            let config = repository.load(collection)?;
            self.ensembles.insert(collection, Arc::new(config));
        }
        Ok(self)
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn ensemble(&self, collection: Collection) -> CloudResult<&Arc<EnsembleConfig>> {
        self.ensembles.get(&collection).ok_or_else(|| {
            CloudError::InvalidConfiguration(format!("No ensemble loaded for {}", collection))
        })
    }

    /// Model bands followed by any display bands not already requested
    fn fetch_bands(&self, config: &EnsembleConfig) -> Vec<BandName> {
        let mut bands = config.bands().to_vec();
        for band in &self.params.display_bands {
            if !bands.contains(band) {
                bands.push(band.clone());
            }
        }
        bands
    }

    /// Process one request end to end
    ///
    /// Any acquisition failure aborts the request; nothing is computed from
    /// a partial band set.
    ///
    /// Blocks the calling thread while bands are fetched. Call it from
    /// synchronous code or from a multi-threaded tokio runtime; inside a
    /// current-thread runtime the request fails with `InvalidConfiguration`.
    pub fn run(&self, request: &CloudRequest, cancel: &CancelHandle) -> CloudResult<CloudReport> {
        let start = Instant::now();
        log::info!(
            "Cloud detection for {} {} over {:?}",
            request.collection,
            request.date,
            request.area
        );

        let config = self.ensemble(request.collection)?;
        if self.params.display_bands.len() <= self.params.display_anchor_channels {
            return Err(CloudError::InvalidConfiguration(format!(
                "{} display bands leave nothing after dropping {} anchors",
                self.params.display_bands.len(),
                self.params.display_anchor_channels
            )));
        }

        let fetch_request = FetchRequest {
            collection: request.collection,
            date: request.date,
            area: request.area,
            bands: self.fetch_bands(config),
        };
        let bandset = fetch_with_deadline(
            Arc::clone(&self.source),
            &fetch_request,
            self.params.fetch_timeout,
            cancel,
        )?;
        if let Some(missing) = fetch_request.bands.iter().find(|b| !bandset.contains(b)) {
            return Err(CloudError::MissingBand(missing.to_string()));
        }

        let assembler = ProductAssembler::new(AssemblyParams {
            scaling: ScalingMode::Downsize,
            kernel: self.params.kernel,
            execution: self.params.execution,
        });
        let product = assembler.assemble(&bandset, config.bands())?;
        let display = assembler.assemble(&bandset, &self.params.display_bands)?;
        drop(bandset);

        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }

        let rgb = normalize(&display, OutputScale::Unit)?.drop_leading(self.params.display_anchor_channels);

        let ensemble = InferenceEnsemble::new(
            Arc::clone(config),
            InferenceParams {
                post_filter_size: self.params.post_filter_size,
                execution: self.params.execution,
            },
        );
        let output = ensemble.infer(&product)?;

        let decision = decide(&output.thick, &output.thin)?;

        let processing_time = start.elapsed();
        log::info!(
            "Request finished in {:.2}s: {:.1}% cloud, {}",
            processing_time.as_secs_f64(),
            decision.cloud_fraction,
            if decision.is_cloudy { "cloudy" } else { "not cloudy" }
        );

        Ok(CloudReport {
            request: request.clone(),
            decision,
            prediction: output.prediction,
            thick: output.thick,
            thin: output.thin,
            rgb,
            processing_time,
        })
    }

    /// Run and hand the report to `sink`
    pub fn run_into(
        &self,
        request: &CloudRequest,
        cancel: &CancelHandle,
        sink: &dyn ReportSink,
    ) -> CloudResult<CloudDecision> {
        let report = self.run(request, cancel)?;
        sink.consume(&report)?;
        Ok(report.decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parse() {
        let area = GeoBox::new(14.555, 14.791, 55.991, 56.103).unwrap();
        let request = CloudRequest::parse("2022-01-06", "l2a", area).unwrap();
        assert_eq!(request.date, NaiveDate::from_ymd_opt(2022, 1, 6).unwrap());
        assert_eq!(request.collection, Collection::L2A);
        assert!(CloudRequest::parse("06/01/2022", "l2a", area).is_err());
        assert!(CloudRequest::parse("2022-01-06", "s1", area).is_err());
    }

    #[test]
    fn test_default_params() {
        let params = PipelineParams::default();
        assert_eq!(params.display_bands[0].as_str(), "B09");
        assert_eq!(params.display_anchor_channels, 1);
        assert_eq!(params.post_filter_size, 1);
    }

    #[test]
    fn test_params_serde_round_trip() {
        let json = serde_json::to_string(&PipelineParams::default()).unwrap();
        let params: PipelineParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params.display_bands.len(), 4);
        assert_eq!(params.kernel, ResampleKernel::Lanczos3);
    }
}
