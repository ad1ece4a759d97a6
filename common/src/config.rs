use std::path::PathBuf;
use std::sync::Arc;

use datafusion::{
    error::DataFusionError,
    execution::{
        disk_manager::DiskManagerConfig,
        memory_pool::{FairSpillPool, GreedyMemoryPool, MemoryPool},
        runtime_env::{RuntimeEnv, RuntimeEnvBuilder},
    },
};
use figment::{
    providers::{Env, Format as _, Toml},
    Figment,
};
use fs_err as fs;
use serde::Deserialize;

use crate::credentials::Credentials;
use crate::export::{ExportType, PartitionError, PartitionValue};
use crate::BoxError;

pub const DEFAULT_MAX_ROWS: usize = 10_000;
pub const DEFAULT_MAX_QUERY_LEN: usize = 16 * 1024;

/// The immutable per-engine-instance data-source descriptor. Constructed
/// once, never mutated; everything that needs it holds it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub bucket: String,
    pub prefix: String,
    pub export_type: ExportType,
    pub table_name: Option<String>,
    pub window: Window,
    pub local_root: Option<PathBuf>,
    pub prefer_local: bool,
    pub credentials: Credentials,
    pub region: Option<String>,
    pub query_library_root: Option<PathBuf>,

    /// Caps enforced by the safety validator.
    pub max_rows: usize,
    pub max_query_len: usize,

    /// Engine tuning.
    pub max_mem_mb: usize,
    pub spill_location: Vec<PathBuf>,
}

/// The inclusive partition window `[start, end]`. Either bound may be absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Window {
    pub start: Option<PartitionValue>,
    pub end: Option<PartitionValue>,
}

impl Window {
    pub fn contains(&self, value: &PartitionValue) -> bool {
        if let Some(start) = &self.start {
            if value < start {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if value > end {
                return false;
            }
        }
        true
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub bucket: String,
    pub prefix: String,
    pub export_type: ExportType,
    pub table_name: Option<String>,
    pub date_start: Option<String>,
    pub date_end: Option<String>,
    pub local_root: Option<PathBuf>,
    #[serde(default = "default_prefer_local")]
    pub prefer_local: bool,
    #[serde(default)]
    pub credentials: Credentials,
    pub region: Option<String>,
    pub query_library_root: Option<PathBuf>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_max_query_len")]
    pub max_query_len: usize,
    #[serde(default)]
    pub max_mem_mb: usize,
    #[serde(default)]
    pub spill_location: Vec<PathBuf>,
}

fn default_prefer_local() -> bool {
    true
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}

fn default_max_query_len() -> usize {
    DEFAULT_MAX_QUERY_LEN
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid date window: {0}")]
    Window(#[from] PartitionError),
}

pub type FigmentJson = figment::providers::Data<figment::providers::Json>;

impl DataConfig {
    /// Loads a TOML config file. Env vars prefixed with `CURQ_CONFIG_`
    /// override file values when `env_override` is set, and a literal JSON
    /// override wins over both.
    pub fn load(
        file: impl Into<PathBuf>,
        env_override: bool,
        literal_override: Option<FigmentJson>,
    ) -> Result<Self, BoxError> {
        let config_path: PathBuf = fs::canonicalize(file.into())?;
        let contents = fs::read_to_string(&config_path)?;

        let config_file: ConfigFile = {
            let mut config_builder = Figment::new().merge(Toml::string(&contents));
            if env_override {
                config_builder = config_builder.merge(Env::prefixed("CURQ_CONFIG_"));
            }
            if let Some(literal_override) = literal_override {
                config_builder = config_builder.merge(literal_override);
            }
            config_builder.extract()?
        };

        Ok(Self::from_file(config_file)?)
    }

    pub fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let granularity = file.export_type.granularity();
        let start = file
            .date_start
            .as_deref()
            .map(|s| granularity.parse_value(s))
            .transpose()?;
        let end = file
            .date_end
            .as_deref()
            .map(|s| granularity.parse_value(s))
            .transpose()?;

        Ok(Self {
            bucket: file.bucket,
            prefix: file.prefix.trim_matches('/').to_string(),
            export_type: file.export_type,
            table_name: file.table_name,
            window: Window { start, end },
            local_root: file.local_root,
            prefer_local: file.prefer_local,
            credentials: file.credentials,
            region: file.region,
            query_library_root: file.query_library_root,
            max_rows: file.max_rows,
            max_query_len: file.max_query_len,
            max_mem_mb: file.max_mem_mb,
            spill_location: file.spill_location,
        })
    }

    /// The logical table name bound to the base data set.
    pub fn table_name(&self) -> &str {
        self.table_name
            .as_deref()
            .unwrap_or_else(|| self.export_type.default_table_name())
    }

    /// Without a local root there is nothing to prefer; the flag is ignored.
    pub fn prefer_local(&self) -> bool {
        self.local_root.is_some() && self.prefer_local
    }

    pub fn make_runtime_env(&self) -> Result<RuntimeEnv, DataFusionError> {
        use datafusion::execution::cache::{
            cache_manager::CacheManagerConfig, cache_unit::DefaultFileStatisticsCache,
        };

        let spill_allowed = !self.spill_location.is_empty();
        let disk_manager = if spill_allowed {
            DiskManagerConfig::NewSpecified(self.spill_location.clone())
        } else {
            DiskManagerConfig::Disabled
        };
        let memory_pool: Option<Arc<dyn MemoryPool>> = if self.max_mem_mb > 0 {
            let max_mem_bytes = self.max_mem_mb * 1024 * 1024;

            if spill_allowed {
                Some(Arc::new(FairSpillPool::new(max_mem_bytes)))
            } else {
                Some(Arc::new(GreedyMemoryPool::new(max_mem_bytes)))
            }
        } else {
            None
        };
        let mut cache_manager = CacheManagerConfig::default();
        // Caches parquet file statistics across queries on one engine.
        cache_manager.table_files_statistics_cache =
            Some(Arc::new(DefaultFileStatisticsCache::default()));
        // Listing staleness is handled by doing our own discovery per query;
        // the engine must not cache file listings.
        cache_manager.list_files_cache = None;

        let runtime_config = RuntimeEnvBuilder {
            disk_manager,
            memory_pool,
            cache_manager,
            ..Default::default()
        };

        runtime_config.build()
    }
}
