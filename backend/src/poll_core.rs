// 核心轮询逻辑
// One tick: guard -> read all registers -> normalize -> persist

use crate::devices::RegisterSpec;
use crate::drivers::sink::RowSink;
use crate::guard::{Rejection, TickGuard};
use crate::normalizer::Normalizer;
use crate::orchestrator::ReadingOrchestrator;
use crate::types::{Granularity, ValidatedRow};
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;

/// Static description of one polling job: what to read and where the row goes.
#[derive(Debug, Clone)]
pub struct PollJob {
    pub name: String,
    pub table: String,
    pub granularity: Granularity,
    pub specs: Vec<RegisterSpec>,
    pub normalizer: Normalizer,
}

/// Result of one trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The guard dropped the tick
    Skipped(Rejection),
    /// The cycle ran; `persisted` is false when the sink failed, `overrun`
    /// is true when reading took too much of the tick interval
    Completed {
        row: ValidatedRow,
        persisted: bool,
        elapsed: Duration,
        overrun: bool,
    },
}

/// Polling controller for one job.
///
/// Cheap to clone; clones share the guard, so ticks from any clone are
/// serialised against each other.
#[derive(Clone)]
pub struct PollController {
    job: Arc<PollJob>,
    orchestrator: ReadingOrchestrator,
    guard: TickGuard,
    sink: Arc<dyn RowSink>,
}

impl PollController {
    pub fn new(
        job: PollJob,
        orchestrator: ReadingOrchestrator,
        guard: TickGuard,
        sink: Arc<dyn RowSink>,
    ) -> Self {
        Self {
            job: Arc::new(job),
            orchestrator,
            guard,
            sink,
        }
    }

    pub fn job(&self) -> &PollJob {
        &self.job
    }

    pub fn guard(&self) -> &TickGuard {
        &self.guard
    }

    /// Execute one cycle for the trigger instant `now`.
    ///
    /// Never fails: read, transform and persistence errors are logged and
    /// folded into the outcome, and the guard is released on every path.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let bucket = self.job.granularity.bucket(now);
        let ticket = match self.guard.try_begin(bucket) {
            Ok(ticket) => ticket,
            Err(rejection) => return TickOutcome::Skipped(rejection),
        };

        info!("[{}] Starting cycle for {}", self.job.name, ticket.bucket());
        let report = self.orchestrator.run_cycle(&self.job.specs).await;
        let row = self.job.normalizer.normalize(bucket, &report.results);
        debug!("[{}] Row for {}: {:?}", self.job.name, bucket, row.fields);

        let persisted = match self.sink.upsert(&self.job.table, &row).await {
            Ok(affected) => {
                info!(
                    "[{}] Stored {} for {} ({} rows affected)",
                    self.job.name, self.job.table, bucket, affected
                );
                true
            }
            Err(e) => {
                error!(
                    "[{}] Failed to store {} for {}: {}",
                    self.job.name, self.job.table, bucket, e
                );
                false
            }
        };

        drop(ticket);
        TickOutcome::Completed {
            row,
            persisted,
            elapsed: report.elapsed,
            overrun: report.overrun,
        }
    }
}
