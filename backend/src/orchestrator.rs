// 读取编排
// Fans one tick's reads out across devices: parallel between links, sequential within a link

use crate::devices::{DeviceReader, RegisterSpec};
use crate::types::ReadingResult;
use futures::future::join_all;
use log::{info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of one read pass: one result per spec plus its timing.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Same length and order as the specs that were read
    pub results: Vec<ReadingResult>,
    pub elapsed: Duration,
    /// `elapsed` exceeded the overrun ratio of the tick interval
    pub overrun: bool,
}

/// Issues exactly one read per [`RegisterSpec`] each cycle.
#[derive(Clone)]
pub struct ReadingOrchestrator {
    reader: DeviceReader,
    /// Nominal trigger period, used for the overrun warning
    tick_interval: Duration,
    /// Fraction of `tick_interval` above which a cycle is reported as slow
    overrun_ratio: f64,
}

impl ReadingOrchestrator {
    pub const DEFAULT_OVERRUN_RATIO: f64 = 0.8;

    pub fn new(reader: DeviceReader, tick_interval: Duration) -> Self {
        Self {
            reader,
            tick_interval,
            overrun_ratio: Self::DEFAULT_OVERRUN_RATIO,
        }
    }

    pub fn with_overrun_ratio(mut self, ratio: f64) -> Self {
        self.overrun_ratio = ratio;
        self
    }

    /// Read every spec once. `results` has the same length and order as `specs`;
    /// failed reads are present as [`crate::types::Reading::Failed`].
    pub async fn run_cycle(&self, specs: &[RegisterSpec]) -> CycleReport {
        let started = Instant::now();

        // Group by physical link, keeping first-seen order
        let mut links: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, spec) in specs.iter().enumerate() {
            let key = spec.endpoint.link_key();
            match links.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(idx),
                None => links.push((key, vec![idx])),
            }
        }

        let per_link = links.iter().map(|(_, members)| async move {
            let mut out = Vec::with_capacity(members.len());
            for &idx in members {
                out.push((idx, self.reader.read(&specs[idx]).await));
            }
            out
        });

        let mut slots: Vec<Option<ReadingResult>> = vec![None; specs.len()];
        for (idx, result) in join_all(per_link).await.into_iter().flatten() {
            slots[idx] = Some(result);
        }
        let results: Vec<ReadingResult> = slots.into_iter().flatten().collect();

        let elapsed = started.elapsed();
        let failed = results.iter().filter(|r| r.reading.is_failed()).count();
        info!(
            "Cycle read {} metrics over {} links in {:?} ({} failed)",
            results.len(),
            links.len(),
            elapsed,
            failed
        );
        let overrun = self.is_overrun(elapsed);
        if overrun {
            warn!(
                "Cycle took {:?}, close to the {:?} tick interval; check network latency",
                elapsed, self.tick_interval
            );
        }

        CycleReport {
            results,
            elapsed,
            overrun,
        }
    }

    fn is_overrun(&self, elapsed: Duration) -> bool {
        elapsed.as_secs_f64() > self.tick_interval.as_secs_f64() * self.overrun_ratio
    }
}
