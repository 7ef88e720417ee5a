//! Bounded-parallel processing of a table, streaming each row to disk.
//!
//! Two levels of concurrency: up to `max_concurrent_batches` batch tasks,
//! each running up to `max_concurrent_rows_per_batch` row tasks. Every row
//! outcome is appended to the [`OutputSink`] as soon as it exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use partgen_shared::{
    ColumnMapping, DEFAULT_MANUFACTURER_COLUMN, DEFAULT_PART_NUMBER_COLUMN, ERROR_MARKER,
    PartGenError, PipelineConfig, ProcessingStats, Result, Row, SKIPPED_MARKER, StatsSnapshot,
    UNKNOWN_MANUFACTURER,
};
use partgen_table::{OutputSink, Table};

use crate::generation::{GenerationOutcome, Generator};
use crate::merge::merge;
use crate::spec_index::SpecIndex;

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Structured notifications emitted during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Columns in use for this run.
    ColumnsResolved {
        part_number: String,
        manufacturer: Option<String>,
        inferred: bool,
    },
    SpecIndexLoaded { entries: usize },
    RunStarted { rows: usize, batches: usize },
    RowSkipped { row: usize },
    /// Generation failed and the local fallback was written.
    RowFallback { row: usize, part_number: String, reason: String },
    RowFailed { row: usize, message: String },
    OutputAborted { message: String },
}

/// Receives progress and events. Implementations must be cheap; they are
/// called from worker tasks.
pub trait PipelineObserver: Send + Sync {
    /// Rows finished so far out of `total`. Called after every batch.
    fn progress(&self, done: usize, total: usize);

    fn event(&self, event: &PipelineEvent);
}

/// Observer that ignores everything.
pub struct SilentObserver;

impl PipelineObserver for SilentObserver {
    fn progress(&self, _done: usize, _total: usize) {}
    fn event(&self, _event: &PipelineEvent) {}
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Concurrency and batching limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub max_concurrent_rows_per_batch: usize,
}

impl From<&PipelineConfig> for SchedulerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            max_concurrent_rows_per_batch: config.max_concurrent_rows_per_batch.max(1),
        }
    }
}

pub struct BatchScheduler {
    generator: Arc<Generator>,
    index: Arc<SpecIndex>,
    settings: SchedulerSettings,
}

impl BatchScheduler {
    pub fn new(generator: Arc<Generator>, index: Arc<SpecIndex>, settings: SchedulerSettings) -> Self {
        Self {
            generator,
            index,
            settings,
        }
    }

    /// Process every row of `table`, appending one output record per row.
    ///
    /// Row failures, including panics, become `ERROR` records and never stop
    /// the run. A sink failure does: no further batches start, in-flight ones
    /// drain, and the write error is returned.
    pub async fn run(
        &self,
        table: Table,
        mapping: Arc<ColumnMapping>,
        sink: Arc<OutputSink>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<StatsSnapshot> {
        let total = table.len();
        let rows: Vec<(usize, Row)> = table.into_rows().into_iter().enumerate().collect();
        let batches: Vec<Vec<(usize, Row)>> = rows
            .chunks(self.settings.batch_size)
            .map(<[_]>::to_vec)
            .collect();

        info!(rows = total, batches = batches.len(), "processing started");
        observer.event(&PipelineEvent::RunStarted {
            rows: total,
            batches: batches.len(),
        });
        observer.progress(0, total);

        let ctx = Arc::new(RunContext {
            generator: self.generator.clone(),
            index: self.index.clone(),
            mapping,
            sink,
            observer,
            stats: ProcessingStats::start(),
            done: Mutex::new(0),
            total,
            halted: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });

        let batch_limit = Arc::new(Semaphore::new(self.settings.max_concurrent_batches));
        let row_limit = self.settings.max_concurrent_rows_per_batch;
        let mut in_flight = JoinSet::new();

        for (number, batch) in batches.into_iter().enumerate() {
            let Ok(permit) = batch_limit.clone().acquire_owned().await else {
                break;
            };
            if ctx.is_halted() {
                warn!(batch = number, "output failed, not starting further batches");
                break;
            }
            let ctx = ctx.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                run_batch(ctx, number, batch, row_limit).await;
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "batch task aborted");
            }
        }

        ctx.stats.finish();
        let snapshot = ctx.stats.snapshot();

        if let Some(err) = ctx.take_fatal() {
            error!(error = %err, "processing aborted");
            return Err(err);
        }

        info!(
            processed = snapshot.processed,
            failed = snapshot.failed,
            skipped = snapshot.skipped,
            secs = snapshot.duration().as_secs_f64(),
            "processing finished"
        );
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

struct RunContext {
    generator: Arc<Generator>,
    index: Arc<SpecIndex>,
    mapping: Arc<ColumnMapping>,
    sink: Arc<OutputSink>,
    observer: Arc<dyn PipelineObserver>,
    stats: ProcessingStats,
    /// Rows finished; held while reporting so progress never goes backwards.
    done: Mutex<usize>,
    total: usize,
    halted: AtomicBool,
    fatal: Mutex<Option<PartGenError>>,
}

impl RunContext {
    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Record the first fatal sink error and stop scheduling.
    fn halt(&self, err: PartGenError) {
        self.halted.store(true, Ordering::SeqCst);
        self.observer.event(&PipelineEvent::OutputAborted {
            message: err.to_string(),
        });
        if let Ok(mut slot) = self.fatal.lock() {
            slot.get_or_insert(err);
        }
    }

    fn take_fatal(&self) -> Option<PartGenError> {
        self.fatal.lock().ok().and_then(|mut slot| slot.take())
    }

    fn part_number<'r>(&self, row: &'r Row) -> Option<&'r str> {
        row.get_trimmed(&self.mapping.part_number_column)
            .or_else(|| row.get_trimmed(DEFAULT_PART_NUMBER_COLUMN))
    }

    fn manufacturer<'r>(&self, row: &'r Row) -> &'r str {
        self.mapping
            .manufacturer_column
            .as_deref()
            .and_then(|column| row.get_trimmed(column))
            .or_else(|| row.get_trimmed(DEFAULT_MANUFACTURER_COLUMN))
            .unwrap_or(UNKNOWN_MANUFACTURER)
    }

    /// Process one row and append its record. Only sink errors escape.
    async fn process_row(&self, position: usize, row: &Row) -> Result<()> {
        let Some(part_number) = self.part_number(row) else {
            debug!(row = position, "empty part number, skipping");
            self.sink.append(row, SKIPPED_MARKER, "Empty part number").await?;
            self.stats.record_skipped();
            self.observer.event(&PipelineEvent::RowSkipped { row: position });
            return Ok(());
        };

        let manufacturer = self.manufacturer(row);
        if manufacturer == UNKNOWN_MANUFACTURER {
            debug!(part_number, "no manufacturer, using default");
        }

        let specs = merge(row, part_number, &self.index);
        let outcome = self.generator.generate(part_number, manufacturer, &specs).await;

        if let GenerationOutcome::Fallback { reason, .. } = &outcome {
            self.observer.event(&PipelineEvent::RowFallback {
                row: position,
                part_number: part_number.to_string(),
                reason: reason.to_string(),
            });
        }

        let result = outcome.into_result();
        self.sink
            .append(row, &result.title, &result.description)
            .await?;
        self.stats.record_processed();
        Ok(())
    }

    /// Write the `ERROR` record for a row whose task died.
    async fn record_failure(&self, position: usize, row: &Row, message: &str) {
        warn!(row = position, %message, "row failed");
        self.stats.record_failed();
        self.observer.event(&PipelineEvent::RowFailed {
            row: position,
            message: message.to_string(),
        });
        let description = format!("Failed to generate: {message}");
        if let Err(e) = self.sink.append(row, ERROR_MARKER, &description).await {
            self.halt(e);
        }
    }
}

async fn run_batch(ctx: Arc<RunContext>, number: usize, rows: Vec<(usize, Row)>, row_limit: usize) {
    let size = rows.len();
    let limit = Arc::new(Semaphore::new(row_limit));
    let mut tasks = JoinSet::new();
    let mut pending: HashMap<tokio::task::Id, (usize, Row)> = HashMap::new();

    for (position, row) in rows {
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let worker = ctx.clone();
        let task_row = row.clone();
        let handle = tasks.spawn(async move {
            let _permit = permit;
            worker.process_row(position, &task_row).await
        });
        pending.insert(handle.id(), (position, row));
    }

    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, Ok(()))) => {
                pending.remove(&id);
            }
            Ok((id, Err(e))) => {
                pending.remove(&id);
                ctx.stats.record_failed();
                ctx.halt(e);
            }
            Err(join_err) => {
                let message = panic_message(&join_err);
                if let Some((position, row)) = pending.remove(&join_err.id()) {
                    ctx.record_failure(position, &row, &message).await;
                }
            }
        }
    }

    if let Ok(mut done) = ctx.done.lock() {
        *done += size;
        debug!(batch = number, rows = size, done = *done, "batch finished");
        ctx.observer.progress(*done, ctx.total);
    }
}

fn panic_message(err: &tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "task cancelled".to_string();
    }
    err.to_string()
}
