//! Poll orchestration: fetch, normalize, match, notify, publish, persist.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use amibot_adapters::{normalize_row, FixtureReleaseSource, LocatorReleasesTable, ReleaseSource};
use amibot_core::{matching_targets, ImageRecord, RepoTarget, TargetConfig};
use amibot_storage::{HttpFetcher, SeenStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod github;
pub mod notify;
pub mod publish;
#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use github::{GitHost, GitIdentity, GithubClient};
pub use notify::{ChatNotifier, NotificationDispatcher, SlackWebhook};
pub use publish::{ConfigUpdatePublisher, PublishSettings};

pub const CRATE_NAME: &str = "amibot-sync";

/// Result of one best-effort side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SideEffect {
    Done,
    Disabled,
    Failed(String),
}

impl SideEffect {
    pub fn is_failed(&self) -> bool {
        matches!(self, SideEffect::Failed(_))
    }
}

/// What to do with records that match no target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    #[default]
    MatchedOnly,
    All,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub repo: String,
    pub outcome: SideEffect,
    pub pull_request_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub record: ImageRecord,
    pub notification: SideEffect,
    pub publishes: Vec<PublishOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub rows: usize,
    pub malformed: usize,
    pub matched: usize,
    pub persisted: usize,
    pub new_images: Vec<ImageReport>,
}

impl RunReport {
    pub fn failed_side_effects(&self) -> usize {
        self.new_images
            .iter()
            .map(|image| {
                usize::from(image.notification.is_failed())
                    + image.publishes.iter().filter(|p| p.outcome.is_failed()).count()
            })
            .sum()
    }

    pub fn summary_line(&self) -> String {
        format!(
            "poll complete: run_id={} rows={} malformed={} matched={} new={} persisted={} failed_side_effects={}",
            self.run_id,
            self.rows,
            self.malformed,
            self.matched,
            self.new_images.len(),
            self.persisted,
            self.failed_side_effects()
        )
    }
}

pub struct PollPipeline {
    source: Box<dyn ReleaseSource>,
    store: SeenStore,
    targets: Vec<RepoTarget>,
    dispatcher: NotificationDispatcher,
    publisher: Option<ConfigUpdatePublisher>,
    persist_policy: PersistPolicy,
}

impl PollPipeline {
    /// A pipeline with notifications and pull requests switched off.
    pub fn new(
        source: Box<dyn ReleaseSource>,
        store: SeenStore,
        targets: Vec<RepoTarget>,
    ) -> Self {
        Self {
            source,
            store,
            targets,
            dispatcher: NotificationDispatcher::disabled(),
            publisher: None,
            persist_policy: PersistPolicy::default(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_publisher(mut self, publisher: ConfigUpdatePublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_persist_policy(mut self, policy: PersistPolicy) -> Self {
        self.persist_policy = policy;
        self
    }

    pub fn store(&self) -> &SeenStore {
        &self.store
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let targets = TargetConfig::load(&config.targets_file)
            .and_then(TargetConfig::into_targets)
            .with_context(|| format!("loading targets from {}", config.targets_file.display()))?;
        let http = config.http_client_config().build_client()?;

        let source: Box<dyn ReleaseSource> = match &config.fixture_path {
            Some(path) => Box::new(FixtureReleaseSource::new(path.clone())),
            None => Box::new(LocatorReleasesTable::new(
                HttpFetcher::from_client(http.clone()),
                config.releases_url.clone(),
            )),
        };

        let store = SeenStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening seen-set {}", config.database_path.display()))?;

        let mut pipeline = Self::new(source, store, targets).with_persist_policy(
            if config.persist_unmatched {
                PersistPolicy::All
            } else {
                PersistPolicy::MatchedOnly
            },
        );

        match &config.slack_webhook_url {
            Some(url) if config.notifications_enabled() => {
                pipeline = pipeline.with_dispatcher(NotificationDispatcher::new(Arc::new(
                    SlackWebhook::new(http.clone(), url.clone()),
                )));
            }
            _ => info!("chat notifications disabled"),
        }

        match &config.github_token {
            Some(token) if config.pull_requests_enabled() => {
                let host = GithubClient::new(
                    http,
                    config.github_api_url.clone(),
                    token.clone(),
                    config.git_identity.clone(),
                );
                pipeline = pipeline.with_publisher(ConfigUpdatePublisher::new(
                    Arc::new(host),
                    PublishSettings {
                        base_branch: config.base_branch.clone(),
                        vars_file: config.vars_file.clone(),
                    },
                ));
            }
            _ => info!("pull requests disabled"),
        }

        Ok(pipeline)
    }

    /// One pass over the releases table.
    ///
    /// Fetch and storage failures abort the run. Malformed rows are skipped, and
    /// notification/publish failures are recorded in the report. A record is
    /// persisted only after its side effects were attempted, so an interrupted run
    /// retries them next time.
    pub async fn run_once(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("poll_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunReport> {
        let started_at = Utc::now();
        let source = self.source.describe();
        let rows = self
            .source
            .fetch_rows()
            .await
            .with_context(|| format!("fetching releases from {source}"))?;
        info!(rows = rows.len(), %source, "fetched releases");

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            source,
            rows: rows.len(),
            malformed: 0,
            matched: 0,
            persisted: 0,
            new_images: Vec::new(),
        };

        for (index, row) in rows.iter().enumerate() {
            let record = match normalize_row(row) {
                Ok(record) => record,
                Err(err) => {
                    warn!(row = index, error = %err, "skipping malformed row");
                    report.malformed += 1;
                    continue;
                }
            };

            let targets = matching_targets(&record, &self.targets);
            if targets.is_empty() {
                if self.persist_policy == PersistPolicy::All {
                    self.persist(&record).await?;
                    report.persisted += 1;
                }
                continue;
            }
            report.matched += 1;

            let seen = self
                .store
                .contains(&record.ami_id)
                .await
                .with_context(|| format!("checking seen-set for {}", record.ami_id))?;
            if seen {
                debug!(ami_id = %record.ami_id, "already seen");
            } else {
                report.new_images.push(self.handle_new_image(&record, &targets).await);
            }

            self.persist(&record).await?;
            report.persisted += 1;
        }

        report.finished_at = Utc::now();
        info!(
            rows = report.rows,
            malformed = report.malformed,
            matched = report.matched,
            new = report.new_images.len(),
            persisted = report.persisted,
            "poll finished"
        );
        Ok(report)
    }

    async fn handle_new_image(&self, record: &ImageRecord, targets: &[&RepoTarget]) -> ImageReport {
        info!(
            ami_id = %record.ami_id,
            zone = %record.zone,
            version = %record.version,
            repos = targets.len(),
            "found new image"
        );
        let notification = self.dispatcher.notify(record).await;

        let mut publishes = Vec::with_capacity(targets.len());
        for target in targets {
            let (outcome, pull_request_url) = match &self.publisher {
                None => (SideEffect::Disabled, None),
                Some(publisher) => match publisher.publish(&target.repo, record).await {
                    Ok(pr) => (SideEffect::Done, pr.url),
                    Err(err) => {
                        error!(
                            repo = %target.repo,
                            ami_id = %record.ami_id,
                            error = %err,
                            "publish failed"
                        );
                        (SideEffect::Failed(err.to_string()), None)
                    }
                },
            };
            publishes.push(PublishOutcome {
                repo: target.repo.clone(),
                outcome,
                pull_request_url,
            });
        }

        ImageReport {
            record: record.clone(),
            notification,
            publishes,
        }
    }

    async fn persist(&self, record: &ImageRecord) -> Result<()> {
        self.store
            .upsert(record)
            .await
            .with_context(|| format!("persisting {}", record.ami_id))
    }
}

/// Writes `<reports_dir>/<run_id>/run_report.json`.
pub async fn write_run_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("run_report.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn run_poll(pipeline: &PollPipeline, config: &SyncConfig) -> Result<RunReport> {
    let report = pipeline.run_once().await?;
    if let Some(dir) = &config.reports_dir {
        let path = write_run_report(dir, &report).await?;
        debug!(path = %path.display(), "wrote run report");
    }
    Ok(report)
}

pub async fn run_poll_once_from_env() -> Result<RunReport> {
    let config = SyncConfig::from_env();
    let pipeline = PollPipeline::from_config(&config).await?;
    run_poll(&pipeline, &config).await
}

/// One scheduled poll. Skipped when the previous tick is still running, so two
/// runs never check and persist the same image concurrently.
async fn scheduled_tick(
    pipeline: &PollPipeline,
    config: &SyncConfig,
    running: &Mutex<()>,
) -> Option<RunReport> {
    let Ok(_guard) = running.try_lock() else {
        warn!(cron = %config.poll_cron, "previous poll still running; skipping tick");
        return None;
    };
    match run_poll(pipeline, config).await {
        Ok(report) => {
            info!("{}", report.summary_line());
            Some(report)
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "scheduled poll failed");
            None
        }
    }
}

/// Schedules `run_poll` on `config.poll_cron`. The caller starts and shuts down the scheduler.
pub async fn build_scheduler(
    pipeline: Arc<PollPipeline>,
    config: &SyncConfig,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = Arc::new(config.clone());
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(&config.poll_cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let config = Arc::clone(&job_config);
        let running = Arc::clone(&running);
        Box::pin(async move {
            scheduled_tick(&pipeline, &config, &running).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.poll_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
