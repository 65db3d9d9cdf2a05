//! Reconciliation pipeline: provider registry, configuration, and the
//! orchestrated pass over the venue store.

pub mod matcher;
pub mod merge;
pub mod orchestrator;
pub mod report;
pub mod retry;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vlr_core::{ProviderId, ResolutionStatus};
use vlr_providers::{provider_for, ProviderKind, ProviderOptions};
use vlr_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, RecordStore, StoreLock, TokenBucketConfig,
};

pub use matcher::{Matcher, MatcherConfig};
pub use merge::{identity_fingerprint, plan_merge, MergeContext, MergeOutcome, MergePlan};
pub use orchestrator::{
    pair_eligibility, CancelHandle, CancelToken, Eligibility, Orchestrator, ProviderGate,
    ProviderHandle, ProviderSettings, RunSettings,
};
pub use report::{report_runs_markdown, write_reports, ProviderCounters, RunSummary};
pub use retry::{LookupFailure, LookupMachine, LookupStep, PairState, RetryPolicy};

pub const CRATE_NAME: &str = "vlr-reconcile";

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub run: RunOverrides,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: ProviderId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: ProviderKind,
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Name of the environment variable holding this provider's API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub link_template: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub cooldown_hours: Option<i64>,
    #[serde(default)]
    pub refresh_after_days: Option<i64>,
    /// Paces HTTP requests to this provider below its quota.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn settings(&self) -> ProviderSettings {
        let defaults = ProviderSettings::default();
        ProviderSettings {
            concurrency: self.concurrency.unwrap_or(defaults.concurrency).max(1),
            cooldown: self.cooldown_hours.map(chrono::Duration::hours),
            refresh_after: self.refresh_after_days.map(chrono::Duration::days),
        }
    }

    pub fn rate_limit(&self) -> Option<TokenBucketConfig> {
        self.requests_per_minute
            .filter(|rpm| *rpm > 0)
            .map(TokenBucketConfig::per_minute)
    }
}

/// Optional `run:` block of the registry file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
    pub lookup_timeout_secs: Option<u64>,
    pub save_every_merges: Option<usize>,
    pub save_interval_secs: Option<u64>,
    pub max_attempts: Option<usize>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub max_throttle_requeues: Option<usize>,
    pub max_throttle_wait_secs: Option<u64>,
}

impl ProviderRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing provider registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.provider_id.trim().is_empty() {
                bail!("provider entry with empty provider_id");
            }
            if !seen.insert(provider.provider_id.as_str()) {
                bail!("duplicate provider_id {}", provider.provider_id);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ProviderConfig> + '_ {
        self.providers.iter().filter(|p| p.enabled)
    }

    pub fn run_settings(&self, config: &ReconcileConfig) -> RunSettings {
        let run = &self.run;
        let backoff_defaults = BackoffPolicy::default();
        let retry_defaults = RetryPolicy::default();
        RunSettings {
            lookup_timeout: Duration::from_secs(
                run.lookup_timeout_secs.unwrap_or(config.lookup_timeout_secs),
            ),
            save_every_merges: run.save_every_merges.unwrap_or(config.save_every_merges),
            save_interval: Duration::from_secs(
                run.save_interval_secs.unwrap_or(config.save_interval_secs),
            ),
            dry_run: config.dry_run,
            retry: RetryPolicy {
                backoff: BackoffPolicy {
                    max_attempts: run.max_attempts.unwrap_or(backoff_defaults.max_attempts),
                    base_delay: run
                        .backoff_base_ms
                        .map(Duration::from_millis)
                        .unwrap_or(backoff_defaults.base_delay),
                    max_delay: run
                        .backoff_max_ms
                        .map(Duration::from_millis)
                        .unwrap_or(backoff_defaults.max_delay),
                },
                max_throttle_requeues: run
                    .max_throttle_requeues
                    .unwrap_or(retry_defaults.max_throttle_requeues),
                max_throttle_wait: run
                    .max_throttle_wait_secs
                    .map(Duration::from_secs)
                    .unwrap_or(retry_defaults.max_throttle_wait),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub store_path: PathBuf,
    pub workspace_root: PathBuf,
    pub providers_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub lookup_timeout_secs: u64,
    pub save_every_merges: usize,
    pub save_interval_secs: u64,
    pub scheduler_enabled: bool,
    pub reconcile_cron: String,
    pub dry_run: bool,
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("VLR_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/venues.json")),
            workspace_root: std::env::var("VLR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            providers_file: std::env::var("VLR_PROVIDERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("providers.yaml")),
            user_agent: std::env::var("VLR_USER_AGENT")
                .unwrap_or_else(|_| "vlr-bot/0.1".to_string()),
            http_timeout_secs: env_parse("VLR_HTTP_TIMEOUT_SECS", 20),
            lookup_timeout_secs: env_parse("VLR_LOOKUP_TIMEOUT_SECS", 30),
            save_every_merges: env_parse("VLR_SAVE_EVERY", 25),
            save_interval_secs: env_parse("VLR_SAVE_INTERVAL_SECS", 30),
            scheduler_enabled: std::env::var("VLR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            reconcile_cron: std::env::var("VLR_RECONCILE_CRON")
                .unwrap_or_else(|_| "0 0 5 * * *".to_string()),
            dry_run: false,
        }
    }

    /// The registry path, resolved against the workspace root when relative.
    pub fn providers_path(&self) -> PathBuf {
        resolve(&self.workspace_root, &self.providers_file)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Outcome of [`ReconcilePipeline::run_once`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub reports_dir: PathBuf,
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    http_config: HttpClientConfig,
}

impl ReconcilePipeline {
    pub fn new(config: ReconcileConfig) -> Result<Self> {
        if config.http_timeout_secs == 0 {
            bail!("VLR_HTTP_TIMEOUT_SECS must be greater than zero");
        }
        let http_config = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };
        Ok(Self {
            config,
            http_config,
        })
    }

    /// HTTP client shared by every adapter of one pass, paced per provider
    /// as the registry asks.
    pub fn http_fetcher(&self, registry: &ProviderRegistry) -> Result<Arc<HttpFetcher>> {
        let mut config = self.http_config.clone();
        config.rate_limits = registry
            .enabled()
            .filter_map(|p| p.rate_limit().map(|limit| (p.provider_id.clone(), limit)))
            .collect();
        Ok(Arc::new(HttpFetcher::new(config)?))
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn load_registry(&self) -> Result<ProviderRegistry> {
        ProviderRegistry::load(&self.config.providers_path()).await
    }

    /// Build adapters for every enabled provider. Credentials are read from
    /// the environment here and nowhere else.
    pub fn build_orchestrator(&self, registry: &ProviderRegistry) -> Result<Orchestrator> {
        let http = self.http_fetcher(registry)?;
        let mut handles = Vec::new();
        for provider in registry.enabled() {
            let api_key = match &provider.api_key_env {
                Some(var) => Some(std::env::var(var).with_context(|| {
                    format!("provider {} expects an API key in {var}", provider.provider_id)
                })?),
                None => None,
            };
            let options = ProviderOptions {
                api_key,
                fixture_path: provider
                    .fixture_path
                    .as_deref()
                    .map(|p| resolve(&self.config.workspace_root, p)),
                link_template: provider.link_template.clone(),
                base_url: provider.base_url.clone(),
                http: Some(http.clone()),
            };
            let adapter = provider_for(&provider.provider_id, provider.kind, options)
                .with_context(|| format!("building provider {}", provider.provider_id))?;
            info!(
                provider_id = %provider.provider_id,
                display_name = provider.display_name.as_deref().unwrap_or(""),
                kind = ?provider.kind,
                "provider registered"
            );
            handles.push(ProviderHandle::new(adapter, provider.settings()));
        }
        if handles.is_empty() {
            warn!("no enabled providers; the pass will only validate the store");
        }
        Ok(Orchestrator::new(
            handles,
            Matcher::new(registry.matcher),
            registry.run_settings(&self.config),
        ))
    }

    /// One full pass: lock the store, load it, reconcile, and write reports.
    pub async fn run_once(&self, cancel: CancelToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id);
        async move {
            let registry = self.load_registry().await?;
            let orchestrator = self.build_orchestrator(&registry)?;

            let store_path = self.config.store_path.clone();
            let _lock = StoreLock::acquire(&store_path, run_id)?;
            let store = RecordStore::load(&store_path)
                .await
                .with_context(|| format!("loading store {}", store_path.display()))?;

            let (_store, summary) = orchestrator.run_with_id(run_id, store, cancel).await?;
            let reports_dir = write_reports(&self.config.workspace_root, &summary).await?;
            info!(reports_dir = %reports_dir.display(), "reports written");
            Ok(RunReport {
                summary,
                reports_dir,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.reconcile_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once(CancelToken::never()).await {
                    Ok(report) => info!(
                        run_id = %report.summary.run_id,
                        accepted = report.summary.totals().accepted,
                        "scheduled reconciliation finished"
                    ),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled reconciliation failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_reconcile_once_from_env(cancel: CancelToken) -> Result<RunReport> {
    let pipeline = ReconcilePipeline::new(ReconcileConfig::from_env())?;
    pipeline.run_once(cancel).await
}

/// Per-provider status counts for a store, for operators checking a file
/// before a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub providers: BTreeMap<ProviderId, BTreeMap<String, usize>>,
    pub manual: usize,
}

impl StoreStats {
    pub fn from_store(store: &RecordStore) -> Self {
        let mut stats = Self {
            records: store.len(),
            ..Default::default()
        };
        for (_, record) in store.get_all() {
            for (provider_id, field) in &record.refs {
                *stats
                    .providers
                    .entry(provider_id.clone())
                    .or_default()
                    .entry(field.status.to_string())
                    .or_default() += 1;
                if field.is_manual() {
                    stats.manual += 1;
                }
            }
        }
        stats
    }

    pub fn count(&self, provider_id: &str, status: ResolutionStatus) -> usize {
        self.providers
            .get(provider_id)
            .and_then(|counts| counts.get(&status.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

pub async fn validate_store(path: &Path) -> Result<StoreStats> {
    let store = RecordStore::load(path)
        .await
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(StoreStats::from_store(&store))
}
