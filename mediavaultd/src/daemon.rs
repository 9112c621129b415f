use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mediavault_core::{DEFAULT_BASE_URL, DiskClient};
use tracing::{error, info, warn};

use crate::backend::DiskBlobStore;
use crate::manifest::Manifest;
use crate::shutdown::{CrashRecoveryHandler, ShutdownSignal};
use crate::sync::limiter::RateLimiterConfig;
use crate::sync::reconcile::StateReconciler;
use crate::sync::retry::RetryPolicy;
use crate::sync::router::{DEFAULT_RESUMABLE_THRESHOLD, TransferRouter};
use crate::sync::row_store::{SqliteRowStore, default_db_path};
use crate::sync::sequencer::{RunSummary, SequencerError, SequencerOptions, UploadSequencer};
use crate::token_provider::StaticTokenProvider;

const DEFAULT_REMOTE_ROOT: &str = "disk:/Chat Backup";
const DEFAULT_MANIFEST_NAME: &str = "manifest.json";
const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 1000;
const DEFAULT_RETRY_MAX_SECS: u64 = 60;
const DEFAULT_PROGRESS_SECS: u64 = 5;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub manifest_path: PathBuf,
    pub database_path: PathBuf,
    pub api_base_url: String,
    pub remote_root: String,
    pub token: Option<String>,
    pub resumable_threshold: u64,
    pub retry: RetryPolicy,
    pub limiter: RateLimiterConfig,
    pub progress_interval: Duration,
    pub options: SequencerOptions,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let manifest_path = std::env::var("MEDIAVAULT_MANIFEST")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_manifest_path);
        let database_path = match std::env::var("MEDIAVAULT_DB") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => default_db_path().context("cannot locate a data directory for the state db")?,
        };
        let api_base_url =
            std::env::var("MEDIAVAULT_API_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let remote_root = std::env::var("MEDIAVAULT_REMOTE_ROOT")
            .unwrap_or_else(|_| DEFAULT_REMOTE_ROOT.to_string());
        let token = std::env::var("MEDIAVAULT_TOKEN").ok();
        let resumable_threshold = read_u64_env(
            "MEDIAVAULT_RESUMABLE_THRESHOLD_BYTES",
            DEFAULT_RESUMABLE_THRESHOLD,
        );
        let retry = RetryPolicy::new(
            u32::try_from(read_u64_env("MEDIAVAULT_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS))
                .unwrap_or(u32::MAX),
            Duration::from_millis(read_u64_env(
                "MEDIAVAULT_RETRY_BASE_MS",
                DEFAULT_RETRY_BASE_MS,
            )),
            Duration::from_secs(DEFAULT_RETRY_MAX_SECS),
        );
        let defaults = RateLimiterConfig::default();
        let limiter = RateLimiterConfig {
            initial_delay: read_millis_env("MEDIAVAULT_PACING_INITIAL_MS", defaults.initial_delay),
            floor: read_millis_env("MEDIAVAULT_PACING_FLOOR_MS", defaults.floor),
            ceiling: read_millis_env("MEDIAVAULT_PACING_CEILING_MS", defaults.ceiling),
            quota_min_sleep: read_millis_env("MEDIAVAULT_QUOTA_SLEEP_MS", defaults.quota_min_sleep),
        };
        let progress_interval =
            Duration::from_secs(read_u64_env("MEDIAVAULT_PROGRESS_SECS", DEFAULT_PROGRESS_SECS));
        let options = SequencerOptions {
            skip_failed: read_bool_env("MEDIAVAULT_SKIP_FAILED", false),
            max_quota_wait: read_optional_secs_env("MEDIAVAULT_MAX_QUOTA_WAIT_SECS"),
        };

        Ok(Self {
            manifest_path,
            database_path,
            api_base_url,
            remote_root,
            token,
            resumable_threshold,
            retry,
            limiter,
            progress_interval,
            options,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    manifest: Manifest,
    store: Arc<SqliteRowStore>,
    credentials: Arc<StaticTokenProvider>,
    blob_store: Arc<DiskBlobStore>,
    recovery: CrashRecoveryHandler,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let manifest = Manifest::load(&config.manifest_path)
            .await
            .with_context(|| format!("failed to load manifest {:?}", config.manifest_path))?;
        let store = SqliteRowStore::open(&config.database_path)
            .await
            .with_context(|| format!("failed to open state db at {:?}", config.database_path))?;
        let credentials = Arc::new(StaticTokenProvider::new(config.token.clone()));
        let client = DiskClient::with_base_url(&config.api_base_url, String::new())
            .context("invalid API base url")?;
        let blob_store = Arc::new(DiskBlobStore::new(
            client,
            credentials.clone(),
            config.remote_root.clone(),
        ));

        Ok(Self {
            config,
            manifest,
            store: Arc::new(store),
            credentials,
            blob_store,
            recovery: CrashRecoveryHandler::new(ShutdownSignal::new()),
        })
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        self.recovery.shutdown()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            manifest = %self.config.manifest_path.display(),
            db = %self.config.database_path.display(),
            remote_root = %self.config.remote_root,
            skip_failed = self.config.options.skip_failed,
            "started"
        );
        let signals = self
            .recovery
            .install()
            .context("failed to install signal handlers")?;
        let result = self.run_channels().await;
        signals.abort();

        let summaries = result?;
        let (uploaded, failed, skipped) = totals(&summaries);
        info!(channels = summaries.len(), uploaded, failed, skipped, "run finished");
        Ok(())
    }

    /// Runs channels in manifest order, one at a time, and stops after the
    /// first interrupted channel.
    pub async fn run_channels(&self) -> anyhow::Result<Vec<RunSummary>> {
        let channels = self
            .manifest
            .clone()
            .into_channels()
            .context("manifest contains an invalid channel")?;
        let mut summaries = Vec::with_capacity(channels.len());
        for mut channel in channels {
            if self.shutdown().is_triggered() {
                break;
            }
            let mut sequencer = self.sequencer();
            match self.recovery.run_channel(&mut sequencer, &mut channel).await {
                Ok(summary) => {
                    let interrupted = summary.interrupted();
                    summaries.push(summary);
                    if interrupted {
                        warn!(channel = %channel.name, "interrupted, remaining channels skipped");
                        break;
                    }
                }
                Err(SequencerError::NotAuthenticated) => {
                    anyhow::bail!("not signed in: set MEDIAVAULT_TOKEN");
                }
                Err(err) => {
                    error!(channel = %channel.name, error = %err, "channel aborted");
                }
            }
        }
        if summaries.is_empty() {
            info!("nothing to do");
        }
        Ok(summaries)
    }

    fn sequencer(&self) -> UploadSequencer {
        let router = TransferRouter::new(self.blob_store.clone())
            .with_resumable_threshold(self.config.resumable_threshold);
        let reconciler = StateReconciler::with_progress_interval(
            self.store.clone(),
            self.config.progress_interval,
        );
        UploadSequencer::new(
            self.credentials.clone(),
            router,
            reconciler,
            self.shutdown().clone(),
        )
        .with_retry_policy(self.config.retry)
        .with_limiter_config(self.config.limiter)
        .with_options(self.config.options)
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
