//! The unified query dispatcher: resolve → prepare → execute.
//!
//! One dispatcher owns one engine adapter. Adapters are not assumed
//! thread-safe, so all access is serialized through an async mutex; each
//! top-level query runs in its own task and contends only for the execute
//! window.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{BoxError, ClientProvider, ContentFormat, DataConfig, Store};
use data_store::cache::LocalCache;
use data_store::remote::{self, DiscoveryError};
use data_store::FileRef;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::engine::{DataFusionEngine, Engine, EngineError, Frame};
use crate::error::{classify, ErrorKind, QueryError};
use crate::output::{self, Output, OutputFormat};
use crate::safety::{self, SafetyLimits};
use crate::source::{self, DataSource, ResolvedSource};

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub force_remote: bool,

    /// Defaults to the configured `max_rows` cap.
    pub row_limit: Option<usize>,

    pub output_format: OutputFormat,

    /// Overall deadline dominating every inner timeout.
    pub deadline: Option<Duration>,

    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub data_source: DataSource,
    pub rows: usize,
    pub execution_time_ms: u64,
    pub engine: String,
}

#[derive(Debug)]
pub struct QueryResponse {
    pub output: Output,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub engine: String,
    pub table_name: String,
    pub export_type: String,
    pub partition_token: String,
    pub remote_root: String,
    pub local_root: Option<PathBuf>,
    pub cache_usable: bool,
    pub date_start: Option<String>,
    pub date_end: Option<String>,
    pub max_rows: usize,
}

pub struct Dispatcher {
    config: Arc<DataConfig>,
    store: Store,
    cache: Option<LocalCache>,
    engine: Mutex<Box<dyn Engine>>,
    engine_name: &'static str,
    limits: SafetyLimits,
}

impl Dispatcher {
    /// Connects to the configured remote through the client provider.
    pub async fn new(config: Arc<DataConfig>, provider: &ClientProvider) -> Result<Self, BoxError> {
        let client = provider
            .s3_client(&config.bucket, config.region.as_deref(), &config.credentials)
            .await?;
        let store = Store::for_remote(&config.bucket, &config.prefix, client)?;
        Self::with_store(config, store)
    }

    /// Uses an already-built store. Tests run over in-memory stores this way.
    pub fn with_store(config: Arc<DataConfig>, store: Store) -> Result<Self, BoxError> {
        let engine = DataFusionEngine::new(&config)?;
        Ok(Self::with_engine(config, store, Box::new(engine)))
    }

    pub fn with_engine(config: Arc<DataConfig>, store: Store, engine: Box<dyn Engine>) -> Self {
        engine.register_object_store(&store.root_url(), store.object_store());
        let engine_name = engine.name();
        let cache = LocalCache::new(&config);
        let limits = SafetyLimits::from_config(&config);
        Self {
            config,
            store,
            cache,
            engine: Mutex::new(engine),
            engine_name,
            limits,
        }
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    /// The primary operation: classify the target, choose the physical
    /// source, register it, execute, and attach metadata. Failures come back
    /// as the closed error taxonomy.
    pub async fn query(
        &self,
        target: &str,
        options: QueryOptions,
    ) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let work = self.query_inner(target, &options, started);
        let work = async {
            match options.deadline {
                Some(deadline) => match tokio::time::timeout(deadline, work).await {
                    Ok(result) => result,
                    Err(_) => Err(QueryError::deadline_exceeded(deadline)),
                },
                None => work.await,
            }
        };
        match &options.cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(QueryError::cancelled()),
                    result = work => result,
                }
            }
            None => work.await,
        }
    }

    #[instrument(skip_all, err)]
    async fn query_inner(
        &self,
        target: &str,
        options: &QueryOptions,
        started: Instant,
    ) -> Result<QueryResponse, QueryError> {
        let resolution =
            source::resolve(target, &self.config, self.cache.as_ref(), options.force_remote)?;
        let row_limit = options.row_limit.unwrap_or(self.config.max_rows);
        safety::validate_row_limit(row_limit, &self.limits)?;

        let frame = match resolution.source {
            ResolvedSource::DirectFile { file } => {
                let table = direct_table_name(&file);
                let sql = format!("SELECT * FROM \"{table}\"");
                safety::validate_sql(&sql, &self.limits)?;

                let mut engine = self.engine.lock().await;
                let registered = engine.register_file(&table, file).await;
                self.check_engine(&engine, registered)?;
                let executed = engine.execute(&sql, Some(row_limit)).await;
                self.check_engine(&engine, executed)?
            }
            ResolvedSource::Sql { sql, .. } => {
                safety::validate_sql(&sql, &self.limits)?;

                let files = self.file_set(resolution.data_source).await?;
                let files = check_homogeneous(files)?;

                let mut engine = self.engine.lock().await;
                let registered = engine
                    .register_table(self.config.table_name(), files)
                    .await;
                self.check_engine(&engine, registered)?;
                let executed = engine.execute(&sql, Some(row_limit)).await;
                self.check_engine(&engine, executed)?
            }
        };

        let metadata = QueryMetadata {
            data_source: resolution.data_source,
            rows: frame.num_rows(),
            execution_time_ms: started.elapsed().as_millis() as u64,
            engine: self.engine_name.to_string(),
        };
        let output = output::render(frame, options.output_format)?;
        Ok(QueryResponse { output, metadata })
    }

    /// Trusted execution path for internal SQL (the view materializer):
    /// still strictly read-only, but without the row and length caps.
    pub async fn execute_trusted(
        &self,
        sql: &str,
        force_remote: bool,
    ) -> Result<(Frame, DataSource), QueryError> {
        safety::validate_read_only(sql)?;
        let backing = if force_remote || !self.cache_usable() {
            DataSource::Remote
        } else if self.config.prefer_local() {
            DataSource::Local
        } else {
            DataSource::Remote
        };
        let files = check_homogeneous(self.file_set(backing).await?)?;

        let mut engine = self.engine.lock().await;
        let registered = engine.register_table(self.config.table_name(), files).await;
        self.check_engine(&engine, registered)?;
        let executed = engine.execute(sql, None).await;
        let frame = self.check_engine(&engine, executed)?;
        Ok((frame, backing))
    }

    /// Registers a produced view output so later queries (and higher view
    /// levels) see it as a table.
    pub async fn register_view(&self, name: &str, file: FileRef) -> Result<(), QueryError> {
        let mut engine = self.engine.lock().await;
        let registered = engine.register_file(name, file).await;
        self.check_engine(&engine, registered)
    }

    /// Drops every adapter registration. A materializer run scopes its
    /// registrations with this.
    pub async fn reset_registrations(&self) {
        self.engine.lock().await.reset();
    }

    /// Column names and types of the base table, via a `LIMIT 0` probe.
    pub async fn schema(&self) -> Result<Vec<(String, String)>, QueryError> {
        let sql = format!("SELECT * FROM \"{}\" LIMIT 0", self.config.table_name());
        let (frame, _) = self.execute_trusted(&sql, false).await?;
        Ok(frame
            .schema
            .fields()
            .iter()
            .map(|field| (field.name().clone(), field.data_type().to_string()))
            .collect())
    }

    pub fn catalog(&self) -> CatalogSummary {
        CatalogSummary {
            engine: self.engine_name.to_string(),
            table_name: self.config.table_name().to_string(),
            export_type: self.config.export_type.to_string(),
            partition_token: self.config.export_type.partition_token().to_string(),
            remote_root: self.store.url().to_string(),
            local_root: self.config.local_root.clone(),
            cache_usable: self.cache_usable(),
            date_start: self.config.window.start.map(|v| v.to_string()),
            date_end: self.config.window.end.map(|v| v.to_string()),
            max_rows: self.config.max_rows,
        }
    }

    fn cache_usable(&self) -> bool {
        self.cache.as_ref().map(LocalCache::is_usable).unwrap_or(false)
    }

    async fn file_set(&self, backing: DataSource) -> Result<Vec<FileRef>, QueryError> {
        match backing {
            DataSource::Local => {
                let cache = self.cache.as_ref().ok_or_else(|| {
                    QueryError::internal("local backing chosen without a local root")
                })?;
                let files = cache.list_files().map_err(|e| {
                    QueryError::internal("could not read the local cache")
                        .with_original(e.to_string())
                })?;
                if files.is_empty() {
                    return Err(self.empty_window_error("local cache").await);
                }
                Ok(files)
            }
            DataSource::Remote => {
                let listing = remote::list(&self.config, &self.store)
                    .await
                    .map_err(map_discovery_error)?;
                if listing.stats.partitions_skipped > 0 {
                    debug!(
                        skipped = listing.stats.partitions_skipped,
                        "discovery skipped unparseable partitions"
                    );
                }
                if listing.files.is_empty() {
                    return Err(self.empty_window_error("remote prefix").await);
                }
                Ok(listing.files)
            }
            DataSource::DirectFile => Err(QueryError::internal(
                "direct-file sources carry their own file",
            )),
        }
    }

    /// An empty file set is legal for discovery but a dead end for a query;
    /// surface it with the partitions that do exist.
    async fn empty_window_error(&self, where_: &str) -> QueryError {
        let mut error = QueryError::not_found(format!(
            "no content files found in the {where_} for the configured window"
        ));
        if let Ok(partitions) = remote::list_partitions(&self.config, &self.store).await {
            if !partitions.is_empty() {
                let shown: Vec<String> = partitions
                    .iter()
                    .rev()
                    .take(6)
                    .rev()
                    .map(|p| p.value.to_string())
                    .collect();
                error = error
                    .with_suggestion(format!("available partitions include: {}", shown.join(", ")));
            }
        }
        error.with_suggestion("widen or clear the date window to match existing partitions")
    }

    /// Classifies an adapter error, enriching `UnknownTable` with the names
    /// the adapter does know.
    fn check_engine<T>(
        &self,
        engine: &Box<dyn Engine>,
        result: Result<T, EngineError>,
    ) -> Result<T, QueryError> {
        result.map_err(|e| {
            let mut error = classify(&e.0);
            if error.kind == ErrorKind::UnknownTable {
                let mut known = engine.registered_tables();
                if known.is_empty() {
                    known.push(self.config.table_name().to_string());
                }
                error = error.with_suggestion(format!("known tables: {}", known.join(", ")));
            }
            error
        })
    }
}

fn map_discovery_error(e: DiscoveryError) -> QueryError {
    match e {
        DiscoveryError::Store(e) => classify(&e.to_string()),
        DiscoveryError::Url(e) => QueryError::internal("discovery produced an invalid file url")
            .with_original(e.to_string()),
    }
}

/// A single registration must be homogeneous: one table, one content format.
/// A window straddling an export format migration is surfaced as an error;
/// every file the discovery layer returned either backs the table or the
/// query fails, never a silent subset.
fn check_homogeneous(files: Vec<FileRef>) -> Result<Vec<FileRef>, QueryError> {
    let parquet = files
        .iter()
        .filter(|f| f.format == ContentFormat::Parquet)
        .count();
    let gzip = files.len() - parquet;
    if parquet > 0 && gzip > 0 {
        return Err(QueryError::internal(format!(
            "the window's file set mixes {parquet} parquet and {gzip} gzipped CSV files \
             and cannot back a single table"
        ))
        .with_suggestion(
            "narrow date_start/date_end to partitions of a single content format",
        )
        .with_suggestion("or re-export the older partitions in the current format"));
    }
    Ok(files)
}

fn direct_table_name(file: &FileRef) -> String {
    let stem = file
        .file_name()
        .strip_suffix(common::export::COLUMNAR_EXT)
        .unwrap_or_else(|| file.file_name());
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
