//! Collection configuration and its on-disk form.

use crate::error::Error;
use crate::hnsw::HnswConfig;
use crate::index::IndexKind;
use crate::metadata::Schema;
use crate::metric::DistanceMetric;
use crate::quant::QuantizerConfig;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Current `config.json` schema version.
pub const CONFIG_VERSION: u32 = 1;

/// Config file name inside the collection directory.
pub const CONFIG_FILE: &str = "config.json";

/// HNSW tuning parameters carried by the collection config.
///
/// `ef_search` is the only field that may change after the first write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Max links per node above layer 0.
    pub m: usize,
    /// Max links per node at layer 0.
    pub m0: usize,
    /// Build-time beam width.
    pub ef_construction: usize,
    /// Query-time beam width.
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

/// Collection-level configuration.
///
/// Immutable after the first write except `ef_search` and `memory_limit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Vector dimensionality. Fixed for the collection's lifetime.
    pub dimension: usize,

    /// Distance metric.
    #[serde(default)]
    pub metric: DistanceMetric,

    /// Index implementation; `None` auto-selects from the collection size.
    #[serde(default)]
    pub index_kind: Option<IndexKind>,

    /// HNSW parameters.
    #[serde(default)]
    pub hnsw: HnswParams,

    /// Optional quantization for the index's stored vectors.
    #[serde(default)]
    pub quantization: Option<QuantizerConfig>,

    /// Heap budget in bytes.
    #[serde(default)]
    pub memory_limit: Option<usize>,

    /// Optional metadata schema, enforced at insert time.
    #[serde(default)]
    pub schema: Option<Schema>,

    /// Expected collection size, used by index auto-selection before any
    /// data exists.
    #[serde(default)]
    pub expected_size: usize,

    /// fsync the WAL on every append.
    #[serde(default)]
    pub sync_on_write: bool,

    /// Background snapshot interval in seconds; `None` disables autosave.
    #[serde(default)]
    pub autosave_interval_secs: Option<u64>,
}

impl CollectionConfig {
    /// Defaults for a given dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: DistanceMetric::default(),
            index_kind: None,
            hnsw: HnswParams::default(),
            quantization: None,
            memory_limit: None,
            schema: None,
            expected_size: 0,
            sync_on_write: false,
            autosave_interval_secs: None,
        }
    }

    /// Sets the metric.
    #[must_use]
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Pins the index kind instead of auto-selecting.
    #[must_use]
    pub fn with_index_kind(mut self, kind: IndexKind) -> Self {
        self.index_kind = Some(kind);
        self
    }

    /// Sets HNSW parameters.
    #[must_use]
    pub fn with_hnsw(mut self, hnsw: HnswParams) -> Self {
        self.hnsw = hnsw;
        self
    }

    /// Enables quantization.
    #[must_use]
    pub fn with_quantization(mut self, quantization: QuantizerConfig) -> Self {
        self.quantization = Some(quantization);
        self
    }

    /// Sets the heap budget.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Attaches a metadata schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Declares the expected collection size for index auto-selection.
    #[must_use]
    pub fn with_expected_size(mut self, expected_size: usize) -> Self {
        self.expected_size = expected_size;
        self
    }

    /// Enables per-append fsync.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Enables background snapshots.
    #[must_use]
    pub fn with_autosave_interval_secs(mut self, secs: u64) -> Self {
        self.autosave_interval_secs = Some(secs);
        self
    }

    /// Structural validation.
    pub fn validate(&self) -> Result<(), Error> {
        if self.dimension == 0 {
            return Err(Error::InvalidConfig("dimension must be > 0".into()));
        }
        self.hnsw_config()
            .validate()
            .map_err(Error::InvalidConfig)?;
        if let Some(q) = &self.quantization {
            if q.dimension != self.dimension {
                return Err(Error::InvalidConfig(format!(
                    "quantizer dimension {} does not match collection dimension {}",
                    q.dimension, self.dimension
                )));
            }
            q.validate().map_err(Error::Quantization)?;
        }
        Ok(())
    }

    /// Expands into the index-level HNSW configuration.
    #[must_use]
    pub fn hnsw_config(&self) -> HnswConfig {
        let mut config = HnswConfig::new(self.dimension).with_metric(self.metric);
        config.m = self.hnsw.m;
        config.m0 = self.hnsw.m0;
        config.ef_construction = self.hnsw.ef_construction;
        config.ef_search = self.hnsw.ef_search;
        config
    }
}

#[derive(Serialize, Deserialize)]
struct ConfigFile {
    version: u32,
    #[serde(flatten)]
    config: CollectionConfig,
}

/// Writes `config.json` into the collection directory.
pub(crate) fn save_config(dir: &Path, config: &CollectionConfig) -> Result<(), Error> {
    let file = ConfigFile {
        version: CONFIG_VERSION,
        config: config.clone(),
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|e| Error::InvalidConfig(format!("config serialization failed: {e}")))?;
    fs::write(dir.join(CONFIG_FILE), json)?;
    Ok(())
}

/// Reads `config.json`, if present.
///
/// A missing file is not an error — older collections predate the config
/// file, and the caller falls back to its own defaults.
pub(crate) fn load_config(dir: &Path) -> Result<Option<CollectionConfig>, Error> {
    let path = dir.join(CONFIG_FILE);
    let json = match fs::read_to_string(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("no {CONFIG_FILE} in {}; using caller defaults", dir.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let file: ConfigFile = serde_json::from_str(&json)
        .map_err(|e| Error::InvalidConfig(format!("config parse failed: {e}")))?;
    if file.version != CONFIG_VERSION {
        return Err(Error::InvalidConfig(format!(
            "unsupported config version {} (current {CONFIG_VERSION})",
            file.version
        )));
    }
    Ok(Some(file.config))
}
