//! The engine adapter: the only place engine-specific behavior lives.
//!
//! The dispatcher consumes the minimal `Engine` capability set; DataFusion
//! is the in-process implementation. Adapter instances are not assumed
//! thread-safe, so the dispatcher serializes access through an async mutex.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::arrow::array::RecordBatch;
use common::arrow::datatypes::SchemaRef;
use common::{ContentFormat, DataConfig};
use data_store::FileRef;
use datafusion::datasource::file_format::csv::CsvFormat;
use datafusion::datasource::file_format::file_compression_type::FileCompressionType;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::error::DataFusionError;
use datafusion::execution::config::SessionConfig;
use datafusion::execution::context::{SQLOptions, SessionContext};
use datafusion::execution::runtime_env::RuntimeEnv;
use datafusion::logical_expr::{LogicalPlan, LogicalPlanBuilder};
use datafusion::sql::TableReference;
use object_store::ObjectStore;
use url::Url;

use crate::safety::parse_single_statement;

/// An ordered, named sequence of columns with typed cells.
#[derive(Debug, Clone)]
pub struct Frame {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl Frame {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect()
    }
}

/// A raw engine error. The dispatcher hands its text to the classifier; the
/// adapter itself never interprets it.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl From<DataFusionError> for EngineError {
    fn from(e: DataFusionError) -> Self {
        Self(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    WindowFunctions,
    Ctes,
    ReadRemoteDirectly,
}

/// The capability set the dispatcher consumes. Registrations are scoped to
/// the adapter instance and survive until `reset`.
#[async_trait]
pub trait Engine: Send {
    fn name(&self) -> &'static str;

    fn supports(&self, feature: Feature) -> bool;

    /// Makes a store reachable for URLs under `url`.
    fn register_object_store(&self, url: &Url, store: Arc<dyn ObjectStore>);

    /// Associates a logical name with a set of files, treated as the union
    /// of their rows.
    async fn register_table(&mut self, name: &str, files: Vec<FileRef>) -> Result<(), EngineError>;

    /// Single-file convenience.
    async fn register_file(&mut self, name: &str, file: FileRef) -> Result<(), EngineError>;

    fn registered_tables(&self) -> Vec<String>;

    /// Drops all table registrations.
    fn reset(&mut self);

    /// Executes `sql`, returning at most `row_limit` rows. `None` lifts the
    /// cap for trusted internal callers (the view materializer).
    async fn execute(&mut self, sql: &str, row_limit: Option<usize>) -> Result<Frame, EngineError>;
}

/// In-process DataFusion adapter.
///
/// Planning and execution run on ephemeral `SessionContext`s sharing one
/// `RuntimeEnv`; since registrations are re-applied per execution, the
/// ephemeral sessions behave the same as a persistent one.
pub struct DataFusionEngine {
    env: Arc<RuntimeEnv>,
    session_config: SessionConfig,
    tables: BTreeMap<String, Vec<FileRef>>,
}

impl DataFusionEngine {
    pub fn new(config: &DataConfig) -> Result<Self, EngineError> {
        let env = Arc::new(config.make_runtime_env()?);

        // `from_env` allows tuning the engine without recompiling.
        let mut session_config = SessionConfig::from_env()?;
        let opts = session_config.options_mut();
        if std::env::var_os("DATAFUSION_EXECUTION_COLLECT_STATISTICS").is_none() {
            // Eagerly read and cache parquet statistics for pruning.
            opts.execution.collect_statistics = true;
        }

        Ok(Self {
            env,
            session_config,
            tables: BTreeMap::new(),
        })
    }

    fn session(&self) -> SessionContext {
        SessionContext::new_with_config_rt(self.session_config.clone(), self.env.clone())
    }

    async fn register_with_session(
        &self,
        ctx: &SessionContext,
        name: &str,
        files: &[FileRef],
    ) -> Result<(), DataFusionError> {
        let format = files
            .first()
            .map(|file| file.format)
            .unwrap_or(ContentFormat::Parquet);
        let options = match format {
            ContentFormat::Parquet => {
                ListingOptions::new(Arc::new(ParquetFormat::default()))
                    .with_file_extension(".parquet")
            }
            ContentFormat::CsvGz => {
                let csv = CsvFormat::default()
                    .with_has_header(true)
                    .with_file_compression_type(FileCompressionType::GZIP);
                ListingOptions::new(Arc::new(csv)).with_file_extension(".gz")
            }
        };

        let urls = files
            .iter()
            .map(|file| {
                let url = file
                    .url()
                    .map_err(|e| DataFusionError::External(Box::new(e)))?;
                ListingTableUrl::parse(url.as_str())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let listing_config = ListingTableConfig::new_with_multi_paths(urls)
            .with_listing_options(options)
            .infer_schema(&ctx.state())
            .await?;
        let table = Arc::new(ListingTable::try_new(listing_config)?);
        ctx.register_table(TableReference::bare(name), table.clone())?;

        // Unquoted identifiers are normalized to lowercase during planning;
        // registering the lowercase twin keeps `FROM CUR` working alongside
        // `FROM "CUR"`.
        let lowercase = name.to_lowercase();
        if lowercase != name {
            ctx.register_table(TableReference::bare(lowercase), table)?;
        }
        Ok(())
    }

    async fn plan_sql(&self, ctx: &SessionContext, sql: &str) -> Result<LogicalPlan, EngineError> {
        let statement =
            parse_single_statement(sql).map_err(|e| EngineError(e.to_string()))?;
        let plan = ctx.state().statement_to_plan(statement).await?;
        verify_plan(&plan)?;
        Ok(plan)
    }
}

#[async_trait]
impl Engine for DataFusionEngine {
    fn name(&self) -> &'static str {
        "datafusion"
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::WindowFunctions | Feature::Ctes | Feature::ReadRemoteDirectly => true,
        }
    }

    fn register_object_store(&self, url: &Url, store: Arc<dyn ObjectStore>) {
        self.env.register_object_store(url, store);
    }

    async fn register_table(&mut self, name: &str, files: Vec<FileRef>) -> Result<(), EngineError> {
        // Validate the registration eagerly so a broken file set fails here,
        // not at execute time.
        let ctx = self.session();
        self.register_with_session(&ctx, name, &files).await?;
        self.tables.insert(name.to_string(), files);
        Ok(())
    }

    async fn register_file(&mut self, name: &str, file: FileRef) -> Result<(), EngineError> {
        self.register_table(name, vec![file]).await
    }

    fn registered_tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    fn reset(&mut self) {
        self.tables.clear();
    }

    async fn execute(&mut self, sql: &str, row_limit: Option<usize>) -> Result<Frame, EngineError> {
        let ctx = self.session();
        for (name, files) in &self.tables {
            self.register_with_session(&ctx, name, files).await?;
        }

        let mut plan = self.plan_sql(&ctx, sql).await?;
        if let Some(limit) = row_limit {
            plan = LogicalPlanBuilder::from(plan).limit(0, Some(limit))?.build()?;
        }

        let df = ctx.execute_logical_plan(plan).await?;
        let schema = SchemaRef::new(df.schema().into());
        let batches = df.collect().await?;
        Ok(Frame { schema, batches })
    }
}

/// Defense-in-depth behind the textual validator: the planned query must be
/// free of DDL, DML and statements.
fn verify_plan(plan: &LogicalPlan) -> Result<(), DataFusionError> {
    SQLOptions::new()
        .with_allow_ddl(false)
        .with_allow_dml(false)
        .with_allow_statements(false)
        .verify_plan(plan)
}
