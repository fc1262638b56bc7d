use crate::core::threshold::{ThresholdParams, Thresholder};
use crate::types::{
    BandName, BinaryMask, CloudError, CloudResult, ExecutionMode, PredictionMap, Product,
};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A pretrained per-pixel regressor
pub trait Regressor: Send + Sync {
    /// Number of features expected by `predict`
    fn input_dim(&self) -> usize;

    /// Estimate cloud optical thickness for one standardized feature vector
    fn predict(&self, features: &[f32]) -> f32;

    /// Predict every row of `features` into `out`
    fn predict_rows(&self, features: &Array2<f32>, out: &mut [f32]) {
        for (row, slot) in features.axis_iter(Axis(0)).zip(out.iter_mut()) {
            *slot = match row.as_slice() {
                Some(values) => self.predict(values),
                None => self.predict(&row.to_vec()),
            };
        }
    }
}

/// Ensemble members, standardization statistics and thresholds for one collection
///
/// Immutable once built; share it across requests behind an `Arc`.
pub struct EnsembleConfig {
    bands: Vec<BandName>,
    band_index: HashMap<BandName, usize>,
    means: Vec<f32>,
    stds: Vec<f32>,
    models: Vec<Arc<dyn Regressor>>,
    cloud_threshold: f32,
    thin_cloud_threshold: f32,
}

impl fmt::Debug for EnsembleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnsembleConfig")
            .field("bands", &self.bands)
            .field("means", &self.means)
            .field("stds", &self.stds)
            .field("models", &self.models.len())
            .field("cloud_threshold", &self.cloud_threshold)
            .field("thin_cloud_threshold", &self.thin_cloud_threshold)
            .finish()
    }
}

impl EnsembleConfig {
    pub fn new(
        bands: Vec<BandName>,
        means: Vec<f32>,
        stds: Vec<f32>,
        models: Vec<Arc<dyn Regressor>>,
        cloud_threshold: f32,
        thin_cloud_threshold: f32,
    ) -> CloudResult<Self> {
        let channels = bands.len();
        if channels == 0 {
            return Err(CloudError::InvalidConfiguration(
                "Ensemble band list must not be empty".to_string(),
            ));
        }

        let mut band_index = HashMap::with_capacity(channels);
        for (i, band) in bands.iter().enumerate() {
            if band_index.insert(band.clone(), i).is_some() {
                return Err(CloudError::InvalidConfiguration(format!(
                    "Band {} listed twice in ensemble configuration",
                    band
                )));
            }
        }

        if means.len() != channels || stds.len() != channels {
            return Err(CloudError::InvalidConfiguration(format!(
                "Expected {} means and stds, got {} and {}",
                channels,
                means.len(),
                stds.len()
            )));
        }
        if means.iter().any(|m| !m.is_finite()) {
            return Err(CloudError::InvalidConfiguration(
                "Band means must be finite".to_string(),
            ));
        }
        if stds.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(CloudError::InvalidConfiguration(
                "Band standard deviations must be finite and positive".to_string(),
            ));
        }

        if models.is_empty() {
            return Err(CloudError::InvalidConfiguration(
                "Ensemble contains no models".to_string(),
            ));
        }
        if let Some((i, model)) = models
            .iter()
            .enumerate()
            .find(|(_, m)| m.input_dim() != channels)
        {
            return Err(CloudError::InvalidConfiguration(format!(
                "Model {} expects {} inputs, ensemble has {} bands",
                i,
                model.input_dim(),
                channels
            )));
        }

        if !cloud_threshold.is_finite() || !thin_cloud_threshold.is_finite() {
            return Err(CloudError::InvalidConfiguration(format!(
                "Thresholds must be finite (cloud {}, thin {})",
                cloud_threshold, thin_cloud_threshold
            )));
        }

        Ok(Self {
            bands,
            band_index,
            means,
            stds,
            models,
            cloud_threshold,
            thin_cloud_threshold,
        })
    }

    pub fn bands(&self) -> &[BandName] {
        &self.bands
    }

    pub fn band_index(&self, band: &BandName) -> Option<usize> {
        self.band_index.get(band).copied()
    }

    pub fn means(&self) -> &[f32] {
        &self.means
    }

    pub fn stds(&self) -> &[f32] {
        &self.stds
    }

    pub fn models(&self) -> &[Arc<dyn Regressor>] {
        &self.models
    }

    pub fn cloud_threshold(&self) -> f32 {
        self.cloud_threshold
    }

    pub fn thin_cloud_threshold(&self) -> f32 {
        self.thin_cloud_threshold
    }

    /// Same ensemble with different thresholds
    pub fn with_thresholds(&self, cloud_threshold: f32, thin_cloud_threshold: f32) -> CloudResult<Self> {
        Self::new(
            self.bands.clone(),
            self.means.clone(),
            self.stds.clone(),
            self.models.clone(),
            cloud_threshold,
            thin_cloud_threshold,
        )
    }

    fn check_product(&self, product: &Product) -> CloudResult<()> {
        if product.channels() != self.bands.len() {
            return Err(CloudError::ShapeMismatch(format!(
                "Product has {} channels, ensemble expects {}",
                product.channels(),
                self.bands.len()
            )));
        }
        for (channel, band) in product.bands().iter().enumerate() {
            match self.band_index(band) {
                Some(i) if i == channel => {}
                Some(i) => {
                    return Err(CloudError::ShapeMismatch(format!(
                        "Band {} at channel {}, ensemble expects channel {}",
                        band, channel, i
                    )))
                }
                None => return Err(CloudError::MissingBand(band.to_string())),
            }
        }
        Ok(())
    }
}

/// Inference parameters
#[derive(Debug, Clone)]
pub struct InferenceParams {
    pub post_filter_size: usize,
    pub execution: ExecutionMode,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            post_filter_size: 1,
            execution: ExecutionMode::Parallel,
        }
    }
}

/// Prediction map and derived cloud masks
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub prediction: PredictionMap,
    pub thick: BinaryMask,
    pub thin: BinaryMask,
}

/// Averages an ensemble of regressors over every pixel of a product
pub struct InferenceEnsemble {
    config: Arc<EnsembleConfig>,
    params: InferenceParams,
}

impl InferenceEnsemble {
    pub fn new(config: Arc<EnsembleConfig>, params: InferenceParams) -> Self {
        Self { config, params }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Predict, threshold and optionally smooth
    pub fn infer(&self, product: &Product) -> CloudResult<InferenceOutput> {
        let prediction = self.predict(product)?;
        let thresholder = Thresholder::new(ThresholdParams {
            post_filter_size: self.params.post_filter_size,
        });
        let (thick, thin) = thresholder.masks(
            &prediction,
            self.config.cloud_threshold,
            self.config.thin_cloud_threshold,
        )?;
        Ok(InferenceOutput {
            prediction,
            thick,
            thin,
        })
    }

    /// Continuous ensemble-mean prediction
    ///
    /// Pixels with any non-finite band value are invalid and map to `NaN`
    /// without being passed to the models. A model producing a non-finite
    /// score also invalidates the pixel.
    pub fn predict(&self, product: &Product) -> CloudResult<PredictionMap> {
        self.config.check_product(product)?;

        let (rows, cols) = product.shape();
        let channels = product.channels();
        let pixels = rows * cols;
        let models = self.config.models();

        log::info!(
            "Running {}-model ensemble on {}x{} pixels, {} bands",
            models.len(),
            rows,
            cols,
            channels
        );

        let standard = product.data().as_standard_layout();
        let flat = standard
            .view()
            .into_shape((channels, pixels))
            .map_err(|e| CloudError::ShapeMismatch(format!("Cannot flatten product: {}", e)))?;

        let valid: Vec<usize> = (0..pixels)
            .filter(|&p| flat.column(p).iter().all(|v| v.is_finite()))
            .collect();
        if valid.len() < pixels {
            log::warn!("{} of {} pixels have invalid band values", pixels - valid.len(), pixels);
        }

        let features = self.standardize(&flat.t(), &valid);
        let sums = self.accumulate(&features);

        let n_models = models.len() as f64;
        let mut prediction = PredictionMap::from_elem((rows, cols), f32::NAN);
        {
            let out = prediction
                .as_slice_mut()
                .ok_or_else(|| CloudError::ShapeMismatch("Non-contiguous prediction map".to_string()))?;
            for (&pixel, &sum) in valid.iter().zip(sums.iter()) {
                let mean = sum / n_models;
                out[pixel] = if mean.is_finite() { mean as f32 } else { f32::NAN };
            }
        }

        Ok(prediction)
    }

    /// (x - mean) / std for the selected pixel rows
    fn standardize(&self, pixel_values: &ArrayView2<f32>, valid: &[usize]) -> Array2<f32> {
        let channels = self.config.bands.len();
        let mut features = Array2::<f32>::zeros((valid.len(), channels));
        for (row, &pixel) in valid.iter().enumerate() {
            let values: ArrayView1<f32> = pixel_values.row(pixel);
            for b in 0..channels {
                features[[row, b]] = (values[b] - self.config.means[b]) / self.config.stds[b];
            }
        }
        features
    }

    /// Per-row sum of every model's prediction
    fn accumulate(&self, features: &Array2<f32>) -> Vec<f64> {
        let n = features.nrows();
        let models = self.config.models();

        let evaluate = |model: &Arc<dyn Regressor>| {
            let mut out = vec![0.0f32; n];
            model.predict_rows(features, &mut out);
            out
        };
        let add = |mut acc: Vec<f64>, scores: Vec<f32>| {
            for (a, s) in acc.iter_mut().zip(scores) {
                *a += s as f64;
            }
            acc
        };

        #[cfg(feature = "parallel")]
        {
            if self.params.execution.is_parallel() {
                use rayon::prelude::*;

                return models
                    .par_iter()
                    .map(evaluate)
                    .fold(|| vec![0.0f64; n], add)
                    .reduce(
                        || vec![0.0f64; n],
                        |mut a, b| {
                            for (x, y) in a.iter_mut().zip(b) {
                                *x += y;
                            }
                            a
                        },
                    );
            }
        }

        models.iter().map(evaluate).fold(vec![0.0f64; n], add)
    }
}
