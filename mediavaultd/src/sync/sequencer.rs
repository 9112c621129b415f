use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::CredentialProvider;
use crate::model::{ChannelState, ProgressRecord, ProgressState};
use crate::shutdown::ShutdownSignal;

use super::dedup::{DedupReport, DuplicateDetector};
use super::limiter::{AdaptiveRateLimiter, RateLimiterConfig};
use super::reconcile::{MergeReport, StateReconciler, StoreError};
use super::retry::{RetryDecision, RetryPolicy};
use super::router::TransferRouter;

const SOURCE_MISSING: &str = "source file no longer exists";
const ALBUM_MISSING: &str = "uploaded but not added to album";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Analyzing,
    Transferring,
    Completed,
    Interrupted,
}

impl SequencerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequencerState::Idle => "idle",
            SequencerState::Analyzing => "analyzing",
            SequencerState::Transferring => "transferring",
            SequencerState::Completed => "completed",
            SequencerState::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerOptions {
    /// Leave files that failed in an earlier run alone.
    pub skip_failed: bool,
    /// Upper bound on quota waiting per file. `None` waits forever.
    pub max_quota_wait: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("not authenticated with the remote service")]
    NotAuthenticated,
    #[error("failed to load persisted state: {0}")]
    Load(#[source] StoreError),
    #[error("failed to write snapshot before transfers: {0}")]
    Snapshot(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub channel_id: String,
    pub channel_name: String,
    pub outcome: SequencerState,
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub already_uploaded: usize,
    /// Eligible files not reached because of an interruption.
    pub remaining: usize,
    pub elapsed: Duration,
    pub merge: MergeReport,
    pub dedup: DedupReport,
    pub persistence_lagged: bool,
}

impl RunSummary {
    pub fn interrupted(&self) -> bool {
        self.outcome == SequencerState::Interrupted
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: uploaded {}, failed {}, skipped {}, already uploaded {}, \
             remaining {} in {:.1}s",
            self.channel_name,
            self.outcome.as_str(),
            self.uploaded,
            self.failed,
            self.skipped,
            self.already_uploaded,
            self.remaining,
            self.elapsed.as_secs_f64()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Uploaded,
    Failed,
    /// Shutdown arrived while waiting to retry; status left as it was.
    Abandoned,
}

/// Drives one channel at a time through analysis and transfers. A fresh
/// rate limiter is built for every run so channels never share pacing.
pub struct UploadSequencer {
    credentials: Arc<dyn CredentialProvider>,
    router: TransferRouter,
    reconciler: StateReconciler,
    detector: DuplicateDetector,
    retry: RetryPolicy,
    limiter_config: RateLimiterConfig,
    limiter: AdaptiveRateLimiter,
    options: SequencerOptions,
    shutdown: ShutdownSignal,
    state: SequencerState,
    /// Files uploaded this run whose media item missed the album.
    unjoined: Vec<(usize, String)>,
}

impl UploadSequencer {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        router: TransferRouter,
        reconciler: StateReconciler,
        shutdown: ShutdownSignal,
    ) -> Self {
        let limiter_config = RateLimiterConfig::default();
        Self {
            credentials,
            router,
            reconciler,
            detector: DuplicateDetector::new(),
            retry: RetryPolicy::default(),
            limiter: AdaptiveRateLimiter::new(limiter_config),
            limiter_config,
            options: SequencerOptions::default(),
            shutdown,
            state: SequencerState::Idle,
            unjoined: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_limiter_config(mut self, config: RateLimiterConfig) -> Self {
        self.limiter_config = config;
        self.limiter = AdaptiveRateLimiter::new(config);
        self
    }

    pub fn with_options(mut self, options: SequencerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    pub async fn run(&mut self, channel: &mut ChannelState) -> Result<RunSummary, SequencerError> {
        let started = Instant::now();
        self.limiter = AdaptiveRateLimiter::new(self.limiter_config);
        self.unjoined.clear();
        self.state = SequencerState::Analyzing;

        if !self.credentials.is_authenticated() {
            self.state = SequencerState::Idle;
            return Err(SequencerError::NotAuthenticated);
        }

        let merge = match self.reconciler.load_and_merge(channel).await {
            Ok(merge) => merge,
            Err(err) => {
                self.state = SequencerState::Idle;
                return Err(SequencerError::Load(err));
            }
        };
        let dedup = self.detector.run(&mut channel.files).await;
        if let Err(err) = self.reconciler.flush_all(channel).await {
            self.state = SequencerState::Idle;
            return Err(SequencerError::Snapshot(err));
        }

        let already_uploaded = channel.counts().uploaded;
        let eligible: Vec<usize> = channel
            .files
            .iter()
            .enumerate()
            .filter(|(_, file)| file.is_eligible(self.options.skip_failed))
            .map(|(index, _)| index)
            .collect();
        let total = eligible.len();
        info!(
            channel = %channel.name,
            files = channel.files.len(),
            eligible = total,
            already_uploaded,
            restored = merge.restored_uploads,
            duplicates = dedup.duplicates,
            "starting transfers"
        );

        self.state = SequencerState::Transferring;
        let mut uploaded = 0;
        let mut failed = 0;
        let mut processed = 0;
        let mut lagged = false;
        let mut last_file = None;

        for (position, &index) in eligible.iter().enumerate() {
            if self.shutdown.is_triggered() {
                break;
            }
            if let Some(delay) = self.limiter.pacing_delay() {
                if !self.sleep_unless_shutdown(delay).await {
                    break;
                }
            }

            let outcome = self.process_file(channel, index).await;
            match outcome {
                FileOutcome::Uploaded => uploaded += 1,
                FileOutcome::Failed => failed += 1,
                FileOutcome::Abandoned => break,
            }
            processed += 1;

            let file = &channel.files[index];
            if !self.reconciler.flush_file(&channel.id, file).await {
                lagged = true;
            }
            let name = file.name().to_string();
            let status = file.status;
            let record =
                ProgressRecord::from_channel(channel, ProgressState::Active, Some(name.clone()));
            let force = position == 0 || position + 1 == total;
            self.reconciler.checkpoint_progress(&record, force).await;
            info!(
                channel = %channel.name,
                file = %name,
                %status,
                done = position + 1,
                total,
                uploaded,
                failed,
                elapsed_s = started.elapsed().as_secs(),
                "progress"
            );
            last_file = Some(name);
        }

        if !self.unjoined.is_empty() {
            self.rejoin_album(channel).await;
        }

        let interrupted = processed < total;
        let (state, progress_state) = if interrupted {
            (SequencerState::Interrupted, ProgressState::Interrupted)
        } else {
            (SequencerState::Completed, ProgressState::Completed)
        };
        self.state = state;

        let record = ProgressRecord::from_channel(channel, progress_state, last_file);
        self.reconciler.checkpoint_progress(&record, true).await;
        if lagged && !interrupted {
            if let Err(err) = self.reconciler.flush_all(channel).await {
                warn!(channel = %channel.id, error = %err, "catch-up snapshot failed");
            }
        }

        let summary = RunSummary {
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
            outcome: state,
            uploaded,
            failed,
            skipped: channel.counts().skipped,
            already_uploaded,
            remaining: total - processed,
            elapsed: started.elapsed(),
            merge,
            dedup,
            persistence_lagged: lagged,
        };
        info!(channel = %channel.name, "{summary}");
        Ok(summary)
    }

    async fn process_file(&mut self, channel: &mut ChannelState, index: usize) -> FileOutcome {
        let mut transient_retries = 0;
        let mut quota_waited = Duration::ZERO;
        loop {
            if channel.files[index].deleted_from_source {
                channel.files[index].mark_failed(SOURCE_MISSING);
                return FileOutcome::Failed;
            }
            let file = &mut channel.files[index];
            file.attempts = file.attempts.saturating_add(1);
            let attempt = file.attempts;

            let result = self
                .router
                .transfer(&channel.files[index], &channel.name, &mut channel.containers)
                .await;
            let file = &mut channel.files[index];
            let err = match result {
                Ok(outcome) => {
                    debug!(file = %file.name(), remote = %outcome.remote_id, "transfer finished");
                    file.mark_uploaded(outcome.remote_link);
                    if let Some(reason) = outcome.album_error {
                        file.upload_error = Some(format!("{ALBUM_MISSING}: {reason}"));
                        self.unjoined.push((index, outcome.remote_id));
                    }
                    self.limiter.record_success();
                    return FileOutcome::Uploaded;
                }
                Err(err) => err,
            };

            match self.retry.decide(&err, transient_retries) {
                RetryDecision::QuotaBackoff => {
                    if let Some(max) = self.options.max_quota_wait {
                        if quota_waited >= max {
                            warn!(
                                file = %file.name(),
                                waited_s = quota_waited.as_secs(),
                                "quota wait limit reached"
                            );
                            file.mark_failed(err.to_string());
                            return FileOutcome::Failed;
                        }
                    }
                    let sleep = self.limiter.record_quota();
                    warn!(
                        channel = %channel.name,
                        file = %file.name(),
                        attempt,
                        delay_ms = sleep.as_millis() as u64,
                        consecutive = self.limiter.state().consecutive_quota_errors,
                        error = %err,
                        "quota exceeded, backing off"
                    );
                    if !self.sleep_unless_shutdown(sleep).await {
                        return FileOutcome::Abandoned;
                    }
                    quota_waited += sleep;
                }
                RetryDecision::RetryAfter(delay) => {
                    transient_retries += 1;
                    warn!(
                        channel = %channel.name,
                        file = %file.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if !self.sleep_unless_shutdown(delay).await {
                        return FileOutcome::Abandoned;
                    }
                }
                RetryDecision::GiveUp => {
                    warn!(
                        channel = %channel.name,
                        file = %file.name(),
                        attempt,
                        error = %err,
                        "upload failed"
                    );
                    file.mark_failed(err.to_string());
                    return FileOutcome::Failed;
                }
            }
        }
    }

    /// Retries album membership for this run's stragglers in one batched
    /// pass. Items that join get their error cleared and their row rewritten.
    async fn rejoin_album(&mut self, channel: &mut ChannelState) {
        let unjoined = std::mem::take(&mut self.unjoined);
        let item_ids: Vec<String> = unjoined.iter().map(|(_, id)| id.clone()).collect();
        let Some(report) = self.router.join_album(&channel.containers, &item_ids).await else {
            return;
        };
        for (index, item_id) in unjoined {
            if !report.added.contains(&item_id) {
                continue;
            }
            let file = &mut channel.files[index];
            file.upload_error = None;
            self.reconciler.flush_file(&channel.id, file).await;
        }
        if !report.rejected.is_empty() {
            warn!(
                channel = %channel.name,
                items = report.rejected.len(),
                "items still missing from album"
            );
        }
    }

    /// Returns false when shutdown cut the wait short.
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.wait() => false,
        }
    }
}

#[cfg(test)]
#[path = "sequencer_tests.rs"]
mod tests;
