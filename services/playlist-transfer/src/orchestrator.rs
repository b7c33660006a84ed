//!
//! src/orchestrator.rs  Andrew Belles  Oct 6th, 2025
//!
//! Turns the scheduler's per-track outcomes into job progress. Each job
//! runs on its own task and is the only publisher for its user id, so
//! its events reach the bus in the order they were consumed.
//!

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{ProgressBus, ProgressEvent};
use crate::config::TransferConfig;
use crate::lookup::LookupEngine;
use crate::playlist::PlaylistService;
use crate::scheduler::{BatchScheduler, ScheduleEvent};
use crate::types::{SpotifyTrackUri, TrackLookupResult, TrackQuery, UserId};
use crate::TransferError;

/// `Completed` means the lookups ran to the end. A terminal action that
/// fails after that moves the job to `Failed`, and the `JobFailed` event,
/// not the state, is what tells the client the playlist was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Running = 0,
    /// Terminal action claimed and in flight
    Finalizing = 1,
    Completed = 2,
    Failed = 3
}

impl JobState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => JobState::Running,
            1 => JobState::Finalizing,
            2 => JobState::Completed,
            _ => JobState::Failed
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug)]
pub struct Job {
    pub id: UserId,
    pub total_tracks: u32,
    found_count: u32,
    not_found_count: u32,
    collected_ids: Vec<SpotifyTrackUri>,
    state: AtomicU8
}

impl Job {
    pub fn new(id: UserId, total_tracks: usize) -> Self {
        Self {
            id,
            total_tracks: u32::try_from(total_tracks).unwrap_or(u32::MAX),
            found_count: 0,
            not_found_count: 0,
            collected_ids: Vec::new(),
            state: AtomicU8::new(JobState::Running as u8)
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn found_count(&self) -> u32 {
        self.found_count
    }

    pub fn not_found_count(&self) -> u32 {
        self.not_found_count
    }

    pub fn collected_ids(&self) -> &[SpotifyTrackUri] {
        &self.collected_ids
    }

    /// Single guard for every state change, fails if `from` no longer holds
    fn transition(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Folds one outcome into the counters. `None` once the job stopped
    /// accepting outcomes or every track is already accounted for.
    fn record(&mut self, result: TrackLookupResult) -> Option<ProgressEvent> {
        if self.state() != JobState::Running {
            return None;
        }
        if self.found_count + self.not_found_count >= self.total_tracks {
            warn!(user = %self.id, total = self.total_tracks, "job.outcome.surplus");
            return None;
        }

        match result.external_id {
            Some(uri) if result.found => {
                self.found_count += 1;
                self.collected_ids.push(uri);
            }
            _ => self.not_found_count += 1
        }
        Some(ProgressEvent::TrackProgress {
            found_count: self.found_count,
            not_found_count: self.not_found_count
        })
    }
}

/// Everything a job needs besides its tracks
#[derive(Clone)]
pub struct JobContext {
    pub playlists: Arc<dyn PlaylistService>,
    pub bus: ProgressBus
}

/// Schedules the lookups for `tracks` and drives the job on its own task.
/// The handle resolves to the finished job.
pub fn start_job(
    user: UserId,
    tracks: Vec<TrackQuery>,
    playlist_name: String,
    engine: Arc<LookupEngine>,
    ctx: JobContext,
    cfg: &TransferConfig
) -> JoinHandle<Job> {
    let job = Job::new(user, tracks.len());
    let cancel = CancellationToken::new();
    let events = BatchScheduler::new(engine, cfg, cancel).schedule(tracks);

    info!(user = %job.id, total = job.total_tracks, playlist = %playlist_name, "job.start");
    tokio::spawn(async move { drive(job, events, &playlist_name, &ctx).await })
}

/// Reports input that could not be turned into a job
pub fn reject_input(user: &UserId, bus: &ProgressBus, error: &TransferError) {
    warn!(user = %user, error = %error, "job.input.rejected");
    bus.publish(user, &ProgressEvent::CsvFileError);
}

pub async fn drive(
    mut job: Job,
    mut events: mpsc::UnboundedReceiver<ScheduleEvent>,
    playlist_name: &str,
    ctx: &JobContext
) -> Job {
    while let Some(event) = events.recv().await {
        match event {
            ScheduleEvent::Outcome(result) => {
                if let Some(progress) = job.record(result) {
                    ctx.bus.publish(&job.id, &progress);
                }
            }
            ScheduleEvent::BatchDone { batch, size, is_last } => {
                debug!(user = %job.id, batch, size, is_last, "job.batch.done");
            }
            ScheduleEvent::Finished => finish(&job, playlist_name, ctx).await,
            ScheduleEvent::Failed(reason) => fail(&job, reason, ctx)
        }
    }

    if !job.state().is_terminal() {
        fail(&job, "schedule ended without finishing".into(), ctx);
    }
    job
}

async fn finish(job: &Job, playlist_name: &str, ctx: &JobContext) {
    if !job.transition(JobState::Running, JobState::Finalizing) {
        debug!(user = %job.id, state = ?job.state(), "job.finish.ignored");
        return;
    }

    match terminal_action(job, playlist_name, ctx).await {
        Ok(()) => {
            job.transition(JobState::Finalizing, JobState::Completed);
            info!(
                user = %job.id, found = job.found_count, not_found = job.not_found_count,
                "job.finished"
            );
            ctx.bus.publish(&job.id, &ProgressEvent::JobFinished);
        }
        Err(e) => {
            job.transition(JobState::Finalizing, JobState::Failed);
            error!(user = %job.id, error = %e, "job.playlist.failed");
            ctx.bus.publish(&job.id, &ProgressEvent::JobFailed { reason: e.to_string() });
        }
    }
}

async fn terminal_action(job: &Job, playlist_name: &str, ctx: &JobContext) ->
    Result<(), TransferError> {
    let handle = ctx.playlists.create_or_reuse_playlist(&job.id, playlist_name).await?;
    ctx.playlists.populate_playlist(&handle, &job.collected_ids).await
}

fn fail(job: &Job, reason: String, ctx: &JobContext) {
    if !job.transition(JobState::Running, JobState::Failed) {
        debug!(user = %job.id, state = ?job.state(), "job.fail.ignored");
        return;
    }
    error!(user = %job.id, reason = %reason, "job.failed");
    ctx.bus.publish(&job.id, &ProgressEvent::JobFailed { reason });
}
