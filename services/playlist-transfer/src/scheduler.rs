//!
//! src/scheduler.rs  Andrew Belles  Oct 4th, 2025
//!
//! Splits a job's tracks into fixed size batches and submits one batch
//! per interval. Batches overlap, only their submission is throttled.
//!

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TransferConfig;
use crate::lookup::LookupEngine;
use crate::types::{TrackLookupResult, TrackQuery};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleEvent {
    /// One track finished its lookup
    Outcome(TrackLookupResult),
    /// Every lookup of the batch has reported
    BatchDone { batch: usize, size: usize, is_last: bool },
    /// All batches are done, sent once and always after every outcome
    Finished,
    /// Nothing more will be looked up
    Failed(String)
}

pub fn partition(tracks: &[TrackQuery], batch_size: usize) -> Vec<Vec<TrackQuery>> {
    tracks.chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

pub struct BatchScheduler {
    engine: Arc<LookupEngine>,
    batch_size: usize,
    interval: Duration,
    cancel: CancellationToken
}

impl BatchScheduler {
    pub fn new(engine: Arc<LookupEngine>, cfg: &TransferConfig, cancel: CancellationToken) -> Self {
        Self {
            engine,
            batch_size: cfg.batch_size,
            interval: cfg.lookup_interval,
            cancel
        }
    }

    /// Starts the schedule in the background and hands back its event stream
    pub fn schedule(self, tracks: Vec<TrackQuery>) -> mpsc::UnboundedReceiver<ScheduleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { self.run(tracks, tx).await });
        rx
    }

    async fn run(self, tracks: Vec<TrackQuery>, tx: mpsc::UnboundedSender<ScheduleEvent>) {
        let user = self.engine.user().clone();

        // token is assumed valid for the whole job, lookups re-refresh on 4xx
        if let Err(e) = self.engine.refresh_credential().await {
            error!(user = %user, error = %e, "schedule.credential.failed");
            let _ = tx.send(ScheduleEvent::Failed(e.to_string()));
            return;
        }

        let batches = partition(&tracks, self.batch_size);
        let total = batches.len();
        info!(user = %user, tracks = tracks.len(), batches = total, "schedule.start");

        let mut running = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    warn!(user = %user, batch = index, "schedule.cancelled");
                    break;
                }
                () = sleep(self.interval) => {}
            }

            debug!(user = %user, batch = index, size = batch.len(), "schedule.batch.submit");
            running.spawn(run_batch(
                self.engine.clone(),
                index,
                batch,
                index + 1 == total,
                tx.clone(),
                self.cancel.clone()
            ));
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(user = %user, error = %e, "schedule.batch.panicked");
                self.cancel.cancel();
                let _ = tx.send(ScheduleEvent::Failed(format!("batch task: {e}")));
            }
        }

        if !self.cancel.is_cancelled() {
            info!(user = %user, "schedule.finished");
            let _ = tx.send(ScheduleEvent::Finished);
        }
    }
}

async fn run_batch(
    engine: Arc<LookupEngine>,
    index: usize,
    batch: Vec<TrackQuery>,
    is_last: bool,
    tx: mpsc::UnboundedSender<ScheduleEvent>,
    cancel: CancellationToken
) {
    let size = batch.len();
    let mut lookups = JoinSet::new();
    for track in batch {
        let engine = engine.clone();
        lookups.spawn(async move { engine.lookup(&track).await });
    }

    loop {
        // dropping the set aborts whatever is still in flight
        let joined = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            joined = lookups.join_next() => joined
        };
        let Some(joined) = joined else { break };

        let outcome = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(user = %engine.user(), batch = index, error = %e, "batch.fatal");
                cancel.cancel();
                let _ = tx.send(ScheduleEvent::Failed(e.to_string()));
                return;
            }
            Err(e) => {
                error!(batch = index, error = %e, "batch.lookup.panicked");
                TrackLookupResult::not_found()
            }
        };

        if tx.send(ScheduleEvent::Outcome(outcome)).is_err() {
            debug!(batch = index, "batch.receiver.gone");
            return;
        }
    }

    let _ = tx.send(ScheduleEvent::BatchDone { batch: index, size, is_last });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixtureApi, Mode};
    use crate::types::UserId;

    fn tracks(n: usize) -> Vec<TrackQuery> {
        let known = [
            ("The Beatles", "Yesterday"),
            ("Tame Impala", "Breathe Deeper"),
            ("Radiohead", "Airbag"),
            ("Portishead", "Roads")
        ];
        (0..n).map(|i| match known.get(i) {
            Some((a, t)) => TrackQuery::new(*a, *t),
            None => TrackQuery::new(format!("Unknown {i}"), format!("Song {i}"))
        }).collect()
    }

    fn scheduler(api: Arc<FixtureApi>, cancel: CancellationToken) -> BatchScheduler {
        let cfg = TransferConfig::default();
        let engine = LookupEngine::new(api, UserId::from("u1"), "r".into(), "US", &cfg);
        BatchScheduler::new(Arc::new(engine), &cfg, cancel)
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<ScheduleEvent>) -> Vec<ScheduleEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn seven_tracks_in_threes() {
        let sizes: Vec<usize> = partition(&tracks(7), 3).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(partition(&[], 3).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_follows_every_outcome() {
        let api = Arc::new(FixtureApi::catalog());
        let rx = scheduler(api.clone(), CancellationToken::new()).schedule(tracks(7));
        let events = drain(rx).await;

        let outcomes: Vec<_> = events.iter()
            .filter_map(|e| match e { ScheduleEvent::Outcome(r) => Some(r), _ => None })
            .collect();
        assert_eq!(outcomes.len(), 7);
        assert_eq!(outcomes.iter().filter(|r| r.found).count(), 4);

        let mut sizes: Vec<usize> = events.iter()
            .filter_map(|e| match e { ScheduleEvent::BatchDone { size, .. } => Some(*size), _ => None })
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 3, 3]);

        assert_eq!(events.last(), Some(&ScheduleEvent::Finished));
        assert_eq!(events.iter().filter(|e| **e == ScheduleEvent::Finished).count(), 1);

        // one refresh before scheduling, none per batch
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(api.execute_calls(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_spaced_by_interval() {
        let api = Arc::new(FixtureApi::catalog());
        let interval = TransferConfig::default().lookup_interval;
        let _rx = scheduler(api.clone(), CancellationToken::new()).schedule(tracks(7));

        sleep(interval - Duration::from_millis(1)).await;
        assert_eq!(api.execute_calls(), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(api.execute_calls(), 3);

        sleep(interval).await;
        assert_eq!(api.execute_calls(), 6);

        sleep(interval).await;
        assert_eq!(api.execute_calls(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_credential_failure_dispatches_nothing() {
        let api = Arc::new(FixtureApi::catalog().fail_refresh_after(0));
        let events = drain(scheduler(api.clone(), CancellationToken::new()).schedule(tracks(5))).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ScheduleEvent::Failed(_)));
        assert_eq!(api.execute_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_failure_mid_job_stops_the_schedule() {
        let api = Arc::new(FixtureApi::new(Mode::Always(401)).fail_refresh_after(1));
        let cancel = CancellationToken::new();
        let events = drain(scheduler(api.clone(), cancel.clone()).schedule(tracks(7))).await;

        assert!(events.iter().any(|e| matches!(e, ScheduleEvent::Failed(_))));
        assert!(!events.contains(&ScheduleEvent::Finished));
        assert!(cancel.is_cancelled());
        // the last batch is never submitted
        assert!(api.execute_calls() < 7);
    }
}
