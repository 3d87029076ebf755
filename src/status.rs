//! Run status registry.
//!
//! Process-local map from run id to a live [`IngestRun`] record — a
//! materialized view that consumers poll or subscribe to, not a replay log.
//!
//! Subscriptions are `tokio::sync::watch` channels: slow consumers observe
//! coalesced snapshots (latest wins) and never block producers, but always
//! observe the terminal state because watch retains the last value until
//! the slot is evicted.
//!
//! Terminal runs are kept for the configured retention window, then
//! evicted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::{IngestPhase, IngestRun, SourceSpec};

struct RunSlot {
    record: IngestRun,
    tx: watch::Sender<IngestRun>,
    cancel: CancellationToken,
}

/// Registry of live and recently finished ingestion runs.
pub struct StatusRegistry {
    runs: Arc<DashMap<String, RunSlot>>,
    retention: Duration,
}

impl StatusRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// Register a new run in the `queued` phase.
    pub fn create(&self, run_id: &str, source_spec: SourceSpec) -> IngestRun {
        let record = IngestRun::new(run_id.to_string(), source_spec);
        let (tx, _) = watch::channel(record.clone());
        self.runs.insert(
            run_id.to_string(),
            RunSlot {
                record: record.clone(),
                tx,
                cancel: CancellationToken::new(),
            },
        );
        record
    }

    /// Read-consistent snapshot of a run.
    pub fn get(&self, run_id: &str) -> Option<IngestRun> {
        self.runs.get(run_id).map(|slot| slot.record.clone())
    }

    /// All current run snapshots (newest first by start time).
    pub fn list(&self) -> Vec<IngestRun> {
        let mut runs: Vec<IngestRun> = self.runs.iter().map(|s| s.record.clone()).collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    /// Mutate a run under its per-run lock and publish the new snapshot.
    ///
    /// `percent` is clamped non-decreasing, terminal phases are stamped with
    /// a completion time, and a terminal transition schedules eviction.
    pub fn update(&self, run_id: &str, mutate: impl FnOnce(&mut IngestRun)) {
        let Some(mut slot) = self.runs.get_mut(run_id) else {
            return;
        };

        let prev_percent = slot.record.percent;
        let was_terminal = slot.record.phase.is_terminal();
        mutate(&mut slot.record);
        if slot.record.percent < prev_percent {
            slot.record.percent = prev_percent;
        }

        let is_terminal = slot.record.phase.is_terminal();
        if is_terminal {
            slot.record.percent = match slot.record.phase {
                IngestPhase::Done => 100,
                _ => slot.record.percent.max(prev_percent),
            };
            if slot.record.completed_at.is_none() {
                slot.record.completed_at = Some(Utc::now());
            }
        }

        let snapshot = slot.record.clone();
        let _ = slot.tx.send(snapshot);
        drop(slot);

        if is_terminal && !was_terminal {
            debug!(run_id, "run reached terminal state, scheduling eviction");
            let runs = Arc::clone(&self.runs);
            let run_id = run_id.to_string();
            let retention = self.retention;
            tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                runs.remove(&run_id);
            });
        }
    }

    /// Subscribe to snapshots. The stream yields the current state first,
    /// coalesces intermediate updates, and ends after eviction.
    pub fn subscribe(&self, run_id: &str) -> Option<WatchStream<IngestRun>> {
        self.runs
            .get(run_id)
            .map(|slot| WatchStream::new(slot.tx.subscribe()))
    }

    /// Request cooperative cancellation. Returns `false` for unknown runs.
    pub fn cancel(&self, run_id: &str) -> bool {
        let Some(slot) = self.runs.get(run_id) else {
            return false;
        };
        slot.cancel.cancel();
        drop(slot);
        self.update(run_id, |run| run.cancel_flag = true);
        true
    }

    /// The cancellation token observed by the run's pipeline.
    pub fn cancel_token(&self, run_id: &str) -> Option<CancellationToken> {
        self.runs.get(run_id).map(|slot| slot.cancel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn spec() -> SourceSpec {
        SourceSpec::WebPage {
            urls: vec!["https://example.com".to_string()],
        }
    }

    fn registry() -> StatusRegistry {
        StatusRegistry::new(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let reg = registry();
        reg.create("r1", spec());
        let run = reg.get("r1").unwrap();
        assert_eq!(run.phase, IngestPhase::Queued);
        assert_eq!(run.percent, 0);
        assert!(reg.get("r2").is_none());
    }

    #[tokio::test]
    async fn percent_is_non_decreasing() {
        let reg = registry();
        reg.create("r1", spec());
        reg.update("r1", |run| run.percent = 40);
        reg.update("r1", |run| run.percent = 10);
        assert_eq!(reg.get("r1").unwrap().percent, 40);
    }

    #[tokio::test]
    async fn terminal_done_pins_percent_and_completion_time() {
        let reg = registry();
        reg.create("r1", spec());
        reg.update("r1", |run| run.phase = IngestPhase::Done);
        let run = reg.get("r1").unwrap();
        assert_eq!(run.percent, 100);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn subscribers_observe_terminal_state() {
        let reg = registry();
        reg.create("r1", spec());
        let mut stream = reg.subscribe("r1").unwrap();

        // Initial snapshot.
        let first = stream.next().await.unwrap();
        assert_eq!(first.phase, IngestPhase::Queued);

        reg.update("r1", |run| run.phase = IngestPhase::Parsing);
        reg.update("r1", |run| run.phase = IngestPhase::Done);

        // Coalescing may skip `parsing`, but `done` must arrive.
        let mut last = None;
        while let Ok(Some(run)) =
            tokio::time::timeout(Duration::from_millis(200), stream.next()).await
        {
            let terminal = run.phase.is_terminal();
            last = Some(run);
            if terminal {
                break;
            }
        }
        assert_eq!(last.unwrap().phase, IngestPhase::Done);
    }

    #[tokio::test]
    async fn cancel_sets_flag_and_token() {
        let reg = registry();
        reg.create("r1", spec());
        let token = reg.cancel_token("r1").unwrap();
        assert!(!token.is_cancelled());

        assert!(reg.cancel("r1"));
        assert!(token.is_cancelled());
        assert!(reg.get("r1").unwrap().cancel_flag);
        assert!(!reg.cancel("missing"));
    }

    #[tokio::test]
    async fn terminal_runs_are_evicted_after_retention() {
        let reg = StatusRegistry::new(Duration::from_millis(20));
        reg.create("r1", spec());
        reg.update("r1", |run| run.phase = IngestPhase::Done);
        assert!(reg.get("r1").is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(reg.get("r1").is_none());
    }
}
