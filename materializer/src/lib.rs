//! The dependency-ordered view materializer.
//!
//! Builds a fixed set of interdependent derived tables from the raw export
//! and persists each as a parquet file under the output root. Views run
//! level by level; within a level they are independent and run on a bounded
//! pool. Each produced output is registered with the engine adapter so
//! higher levels see it as a table. The first failure aborts the run:
//! already-written outputs are preserved, the rest is reported as skipped.

pub mod manifest;

use std::path::PathBuf;
use std::sync::Arc;

use common::parquet::arrow::AsyncArrowWriter;
use common::parquet::basic::{Compression, ZstdLevel};
use common::parquet::file::properties::WriterProperties;
use data_store::FileRef;
use fs_err as fs;
use futures::StreamExt;
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use query::{Dispatcher, Frame};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use manifest::{Manifest, ManifestError, ViewDef};

#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    /// Concurrent views within one level.
    pub parallelism: usize,

    /// Force every view to read the base table remotely, regardless of the
    /// cache. The uncached case forces remote on its own.
    pub force_remote: bool,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            force_remote: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MaterializeReport {
    pub produced: Vec<String>,
    pub failed: Vec<FailedView>,
    pub skipped: Vec<String>,
}

impl MaterializeReport {
    /// A run succeeds iff every view in the manifest wrote its output.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Debug)]
pub struct FailedView {
    pub view: String,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("output root is unusable: {0}")]
    OutputRoot(#[from] std::io::Error),

    #[error("output store error: {0}")]
    OutputStore(#[from] object_store::Error),

    #[error("materialization was cancelled")]
    Cancelled,
}

pub struct Materializer {
    dispatcher: Arc<Dispatcher>,
    output_root: PathBuf,
    options: MaterializeOptions,
}

impl Materializer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        output_root: impl Into<PathBuf>,
        options: MaterializeOptions,
    ) -> Self {
        Self {
            dispatcher,
            output_root: output_root.into(),
            options,
        }
    }

    /// Runs the whole manifest in dependency order. Cycles fail before any
    /// execution. Re-running with identical inputs rewrites the same output
    /// paths in place.
    #[instrument(skip_all, err)]
    pub async fn run(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<MaterializeReport, MaterializeError> {
        let levels = manifest.levels()?;
        let total: usize = levels.iter().map(Vec::len).sum();
        info!(views = total, levels = levels.len(), "starting materialization run");

        fs::create_dir_all(&self.output_root)?;
        let output_root = fs::canonicalize(&self.output_root)?;
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(&output_root)?);

        let result = self.run_levels(&levels, &output_root, &store, cancel).await;

        // Adapter registrations are scoped to this run.
        self.dispatcher.reset_registrations().await;
        result
    }

    async fn run_levels(
        &self,
        levels: &[Vec<&ViewDef>],
        output_root: &std::path::Path,
        store: &Arc<dyn ObjectStore>,
        cancel: &CancellationToken,
    ) -> Result<MaterializeReport, MaterializeError> {
        let mut report = MaterializeReport::default();

        for (index, views) in levels.iter().enumerate() {
            let level = index + 1;
            if cancel.is_cancelled() {
                return Err(MaterializeError::Cancelled);
            }

            let outcomes = futures::stream::iter(
                views
                    .iter()
                    .map(|view| self.run_view(store, output_root, level, view, cancel)),
            )
            .buffer_unordered(self.options.parallelism.max(1))
            .collect::<Vec<Result<String, FailedView>>>()
            .await;

            if cancel.is_cancelled() {
                return Err(MaterializeError::Cancelled);
            }

            let mut level_failed = vec![];
            for outcome in outcomes {
                match outcome {
                    Ok(view) => report.produced.push(view),
                    Err(failed) => level_failed.push(failed),
                }
            }
            report.produced.sort();

            if !level_failed.is_empty() {
                // Abort: later levels depend on what just failed. Outputs
                // already written stay in place.
                for failed in &level_failed {
                    warn!(view = %failed.view, error = %failed.error, "view failed");
                }
                report.failed = level_failed;
                report.skipped = levels[index + 1..]
                    .iter()
                    .flat_map(|level| level.iter().map(|view| view.name.clone()))
                    .collect();
                return Ok(report);
            }
        }

        info!(produced = report.produced.len(), "materialization run complete");
        Ok(report)
    }

    async fn run_view(
        &self,
        store: &Arc<dyn ObjectStore>,
        output_root: &std::path::Path,
        level: usize,
        view: &ViewDef,
        cancel: &CancellationToken,
    ) -> Result<String, FailedView> {
        let failed = |error: String| FailedView {
            view: view.name.clone(),
            error,
        };

        let work = async {
            debug!(view = %view.name, level, "materializing view");
            let (frame, _) = self
                .dispatcher
                .execute_trusted(&view.sql, self.options.force_remote)
                .await
                .map_err(|e| e.to_string())?;

            fs::create_dir_all(output_root.join(format!("level_{level}")))
                .map_err(|e| e.to_string())?;
            let final_path = StorePath::from(format!("level_{level}/{}.parquet", view.name));
            let staged_path = StorePath::from(format!(
                "level_{level}/.{}.parquet.stage",
                view.name
            ));
            write_parquet(store, &staged_path, &frame)
                .await
                .map_err(|e| e.to_string())?;
            store
                .rename(&staged_path, &final_path)
                .await
                .map_err(|e| e.to_string())?;

            let on_disk = output_root.join(format!("level_{level}/{}.parquet", view.name));
            let file = FileRef::standalone(&on_disk)
                .ok_or_else(|| format!("produced output is not a columnar file: {on_disk:?}"))?;
            self.dispatcher
                .register_view(&view.name, file)
                .await
                .map_err(|e| e.to_string())?;

            debug!(view = %view.name, rows = frame.num_rows(), "view produced");
            Ok::<String, String>(view.name.clone())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(failed("cancelled".to_string())),
            result = work => result.map_err(failed),
        }
    }
}

/// Stage-then-rename parquet write through the object store, zstd-compressed.
async fn write_parquet(
    store: &Arc<dyn ObjectStore>,
    path: &StorePath,
    frame: &Frame,
) -> Result<(), common::BoxError> {
    let opts = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let object_writer = BufWriter::new(store.clone(), path.clone());
    let mut writer = AsyncArrowWriter::try_new(object_writer, frame.schema.clone(), Some(opts))?;
    for batch in &frame.batches {
        writer.write(batch).await?;
    }
    writer.close().await?;
    Ok(())
}
