use crate::core::ensemble::{EnsembleConfig, Regressor};
use crate::types::{BandName, CloudError, CloudResult, Collection};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Manifest file name inside each collection directory
pub const MANIFEST_FILE: &str = "ensemble.json";

/// Loads the ensemble for a collection, once per process
pub trait ModelRepository {
    fn load(&self, collection: Collection) -> CloudResult<EnsembleConfig>;
}

/// Band order, training statistics and thresholds the shipped ensembles were fitted with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefaults {
    pub bands: Vec<BandName>,
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
    pub cloud_threshold: f32,
    pub thin_cloud_threshold: f32,
}

impl CollectionDefaults {
    pub fn for_collection(collection: Collection) -> Self {
        match collection {
            Collection::L1C => Self {
                bands: known_bands(&[
                    "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11",
                    "B12",
                ]),
                means: vec![
                    0.49675034, 0.47293043, 0.564903, 0.52927473, 0.65845986, 0.93623101,
                    0.90515048, 0.99451205, 0.45604575, 0.07375108, 0.53309616, 0.43224668,
                ],
                stds: vec![
                    0.28274442, 0.27778134, 0.28483809, 0.31573642, 0.28173209, 0.31942519,
                    0.32981911, 0.36159493, 0.29364748, 0.1140917, 0.41934613, 0.3335538,
                ],
                cloud_threshold: 0.015,
                thin_cloud_threshold: 0.007,
            },
            // L2A has no cirrus band (B10)
            Collection::L2A => Self {
                bands: known_bands(&[
                    "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B11", "B12",
                ]),
                means: vec![
                    0.4967399, 0.47297233, 0.56489476, 0.52922534, 0.65842892, 0.93619591,
                    0.90525398, 0.99455938, 0.45607598, 0.53310641, 0.43227456,
                ],
                stds: vec![
                    0.28320853, 0.27819884, 0.28527526, 0.31613214, 0.28244289, 0.32065759,
                    0.33095272, 0.36282185, 0.29398295, 0.41964159, 0.33375454,
                ],
                cloud_threshold: 0.02,
                thin_cloud_threshold: 0.01,
            },
        }
    }
}

fn known_bands(names: &[&'static str]) -> Vec<BandName> {
    names.iter().map(|name| BandName::known(name)).collect()
}

/// Fully connected layer, `weights` is (outputs x inputs)
#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Feed-forward regressor with ReLU between layers
#[derive(Debug, Clone)]
pub struct MlpRegressor {
    layers: Vec<DenseLayer>,
    relu_output: bool,
}

impl MlpRegressor {
    pub fn new(layers: Vec<DenseLayer>, relu_output: bool) -> CloudResult<Self> {
        let first = layers.first().ok_or_else(|| {
            CloudError::InvalidConfiguration("Regressor has no layers".to_string())
        })?;
        let mut width = first.weights.ncols();
        for (i, layer) in layers.iter().enumerate() {
            let (outputs, inputs) = layer.weights.dim();
            if inputs != width || layer.bias.len() != outputs {
                return Err(CloudError::InvalidConfiguration(format!(
                    "Layer {} is {}x{} with {} biases, expected {} inputs",
                    i,
                    outputs,
                    inputs,
                    layer.bias.len(),
                    width
                )));
            }
            width = outputs;
        }
        if width != 1 {
            return Err(CloudError::InvalidConfiguration(format!(
                "Regressor must produce a single output, got {}",
                width
            )));
        }
        Ok(Self { layers, relu_output })
    }

    pub fn from_file(path: &Path) -> CloudResult<Self> {
        log::debug!("Loading regressor from {}", path.display());
        let file: MlpFile = serde_json::from_str(&fs::read_to_string(path)?)?;
        file.into_regressor()
    }
}

impl Regressor for MlpRegressor {
    fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |l| l.weights.ncols())
    }

    fn predict(&self, features: &[f32]) -> f32 {
        let mut activation = Array1::from(features.to_vec());
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            activation = layer.weights.dot(&activation) + &layer.bias;
            if i < last || self.relu_output {
                activation.mapv_inplace(|v| v.max(0.0));
            }
        }
        activation[0]
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerFile {
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

/// On-disk regressor description
#[derive(Debug, Serialize, Deserialize)]
struct MlpFile {
    layers: Vec<LayerFile>,
    #[serde(default)]
    relu_output: bool,
}

impl MlpFile {
    fn into_regressor(self) -> CloudResult<MlpRegressor> {
        let layers = self
            .layers
            .into_iter()
            .map(|layer| {
                let outputs = layer.weights.len();
                let inputs = layer.weights.first().map_or(0, |row| row.len());
                if layer.weights.iter().any(|row| row.len() != inputs) {
                    return Err(CloudError::InvalidConfiguration(
                        "Ragged weight matrix".to_string(),
                    ));
                }
                let flat: Vec<f32> = layer.weights.into_iter().flatten().collect();
                let weights = Array2::from_shape_vec((outputs, inputs), flat).map_err(|e| {
                    CloudError::InvalidConfiguration(format!("Weight matrix shape: {}", e))
                })?;
                Ok(DenseLayer {
                    weights,
                    bias: Array1::from(layer.bias),
                })
            })
            .collect::<CloudResult<Vec<_>>>()?;
        MlpRegressor::new(layers, self.relu_output)
    }
}

/// Collection manifest; omitted statistics fall back to [`CollectionDefaults`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsembleManifest {
    #[serde(default)]
    pub bands: Option<Vec<BandName>>,
    #[serde(default)]
    pub means: Option<Vec<f32>>,
    #[serde(default)]
    pub stds: Option<Vec<f32>>,
    #[serde(default)]
    pub cloud_threshold: Option<f32>,
    #[serde(default)]
    pub thin_cloud_threshold: Option<f32>,
    /// Model files relative to the manifest directory
    pub models: Vec<PathBuf>,
}

/// Reads `<root>/<collection>/ensemble.json` and the model files it lists
#[derive(Debug, Clone)]
pub struct JsonModelRepository {
    root: PathBuf,
}

impl JsonModelRepository {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Platform data directory, e.g. `~/.local/share/cloudmask/models`
    pub fn default_location() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("cloudmask").join("models"))
    }

    pub fn collection_dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.to_string())
    }
}

impl ModelRepository for JsonModelRepository {
    fn load(&self, collection: Collection) -> CloudResult<EnsembleConfig> {
        let dir = self.collection_dir(collection);
        let manifest_path = dir.join(MANIFEST_FILE);
        log::info!("Loading {} ensemble from {}", collection, manifest_path.display());

        let manifest: EnsembleManifest = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;
        let defaults = CollectionDefaults::for_collection(collection);

        let models = manifest
            .models
            .iter()
            .map(|path| {
                let regressor = MlpRegressor::from_file(&dir.join(path))?;
                Ok(Arc::new(regressor) as Arc<dyn Regressor>)
            })
            .collect::<CloudResult<Vec<_>>>()?;
        log::info!("Loaded {} ensemble members", models.len());

        EnsembleConfig::new(
            manifest.bands.unwrap_or(defaults.bands),
            manifest.means.unwrap_or(defaults.means),
            manifest.stds.unwrap_or(defaults.stds),
            models,
            manifest.cloud_threshold.unwrap_or(defaults.cloud_threshold),
            manifest
                .thin_cloud_threshold
                .unwrap_or(defaults.thin_cloud_threshold),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_defaults_are_consistent() {
        for collection in [Collection::L1C, Collection::L2A] {
            let defaults = CollectionDefaults::for_collection(collection);
            assert_eq!(defaults.bands.len(), defaults.means.len());
            assert_eq!(defaults.bands.len(), defaults.stds.len());
            assert!(defaults.thin_cloud_threshold <= defaults.cloud_threshold);
        }
        assert_eq!(CollectionDefaults::for_collection(Collection::L1C).bands.len(), 12);
        assert_eq!(CollectionDefaults::for_collection(Collection::L2A).bands.len(), 11);
    }

    #[test]
    fn test_mlp_forward_pass() {
        // hidden = relu([x0 - x1, x1 - x0]) ; out = h0 + 2 h1 - 0.5
        let layers = vec![
            DenseLayer {
                weights: Array2::from_shape_vec((2, 2), vec![1.0, -1.0, -1.0, 1.0]).unwrap(),
                bias: Array1::zeros(2),
            },
            DenseLayer {
                weights: Array2::from_shape_vec((1, 2), vec![1.0, 2.0]).unwrap(),
                bias: Array1::from(vec![-0.5]),
            },
        ];
        let linear_out = MlpRegressor::new(layers.clone(), false).unwrap();
        assert_eq!(linear_out.input_dim(), 2);
        assert_abs_diff_eq!(linear_out.predict(&[3.0, 1.0]), 1.5);
        assert_abs_diff_eq!(linear_out.predict(&[1.0, 1.0]), -0.5);

        let relu_out = MlpRegressor::new(layers, true).unwrap();
        assert_abs_diff_eq!(relu_out.predict(&[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_mlp_shape_validation() {
        let mismatched = vec![
            DenseLayer {
                weights: Array2::zeros((3, 2)),
                bias: Array1::zeros(3),
            },
            DenseLayer {
                weights: Array2::zeros((1, 2)),
                bias: Array1::zeros(1),
            },
        ];
        assert!(MlpRegressor::new(mismatched, false).is_err());

        let wide_output = vec![DenseLayer {
            weights: Array2::zeros((2, 2)),
            bias: Array1::zeros(2),
        }];
        assert!(MlpRegressor::new(wide_output, false).is_err());
        assert!(MlpRegressor::new(Vec::new(), false).is_err());
    }
}
