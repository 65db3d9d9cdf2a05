//! Durable venue record store, run lock, and HTTP fetch utilities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use vlr_core::{FieldUpdate, Provenance, ResolutionStatus, VenueId, VenueRecord};

pub const CRATE_NAME: &str = "vlr-storage";

const ERROR_BODY_EXCERPT_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum StoreCorruptError {
    #[error("store {path} is not a JSON object keyed by venue id: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate venue id `{venue_id}`")]
    DuplicateVenueId { venue_id: String },
    #[error("empty venue id")]
    EmptyVenueId,
    #[error("venue `{venue_id}` is malformed: {source}")]
    MalformedRecord {
        venue_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("venue `{venue_id}` has a reference with an empty provider key")]
    EmptyProviderKey { venue_id: String },
    #[error("venue `{venue_id}` reference `{provider_id}` is resolved but has no value")]
    ResolvedWithoutValue {
        venue_id: String,
        provider_id: String,
    },
    #[error("venue `{venue_id}` reference `{provider_id}` is manual but has no value")]
    ManualWithoutValue {
        venue_id: String,
        provider_id: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Corrupt(#[from] StoreCorruptError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing store: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("store {path} is locked by another run ({holder})")]
    Locked { path: String, holder: String },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result of routing one field update through [`RecordStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
    SkippedManual,
    UnknownRecord,
}

#[derive(Debug, Clone)]
pub struct SaveReceipt {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub saved_at: DateTime<Utc>,
}

/// Top-level store entries in file order, so duplicate ids are detectable
/// before a map would silently collapse them.
struct RawEntries(Vec<(String, JsonValue)>);

impl<'de> Deserialize<'de> for RawEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object keyed by venue id")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawEntries, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, JsonValue>()? {
                    entries.push((key, value));
                }
                Ok(RawEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// In-memory working set of the canonical venue dataset.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    records: BTreeMap<VenueId, VenueRecord>,
    dirty: bool,
}

impl RecordStore {
    /// Read and validate the durable dataset. Nothing is returned unless every
    /// record parses and passes validation.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = fs::read_to_string(&path)
            .await
            .map_err(|err| StoreError::io(format!("reading {}", path.display()), err))?;
        let records = parse_records(&path, &text)?;
        info!(path = %path.display(), records = records.len(), "loaded record store");
        Ok(Self {
            path,
            records,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, venue_id: &str) -> Option<&VenueRecord> {
        self.records.get(venue_id)
    }

    /// Lazy pass over every record in venue-id order. Call again to restart.
    pub fn get_all(&self) -> impl Iterator<Item = (&VenueId, &VenueRecord)> + '_ {
        self.records.iter()
    }

    /// Single mutation point for reference fields. Auto updates never replace
    /// a manual field.
    pub fn apply(&mut self, venue_id: &str, update: FieldUpdate) -> ApplyOutcome {
        let Some(record) = self.records.get_mut(venue_id) else {
            warn!(venue_id, provider_id = %update.provider_id, "update for unknown venue dropped");
            return ApplyOutcome::UnknownRecord;
        };

        if let Some(existing) = record.refs.get(&update.provider_id) {
            if existing.is_manual() && update.field.provenance == Provenance::Auto {
                warn!(
                    venue_id,
                    provider_id = %update.provider_id,
                    "auto update rejected for manually curated reference"
                );
                return ApplyOutcome::SkippedManual;
            }
            if *existing == update.field {
                return ApplyOutcome::Unchanged;
            }
        }

        debug!(venue_id, provider_id = %update.provider_id, status = %update.field.status, "applying reference update");
        record.refs.insert(update.provider_id, update.field);
        self.dirty = true;
        ApplyOutcome::Applied
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut bytes = serde_json::to_vec_pretty(&self.records).map_err(StoreError::Serialize)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Write the full dataset via temp file + rename so readers only ever see
    /// a complete store.
    pub async fn save(&mut self) -> Result<SaveReceipt, StoreError> {
        let bytes = self.to_json_bytes()?;
        write_atomic(&self.path, &bytes).await?;
        self.dirty = false;
        let receipt = SaveReceipt {
            path: self.path.clone(),
            content_hash: sha256_hex(&bytes),
            byte_size: bytes.len(),
            saved_at: Utc::now(),
        };
        info!(path = %receipt.path.display(), bytes = receipt.byte_size, hash = %receipt.content_hash, "saved record store");
        Ok(receipt)
    }
}

fn parse_records(path: &Path, text: &str) -> Result<BTreeMap<VenueId, VenueRecord>, StoreCorruptError> {
    let RawEntries(entries) =
        serde_json::from_str(text).map_err(|source| StoreCorruptError::Parse {
            path: path.display().to_string(),
            source,
        })?;

    let mut seen = HashSet::with_capacity(entries.len());
    let mut records = BTreeMap::new();
    for (venue_id, value) in entries {
        if venue_id.trim().is_empty() {
            return Err(StoreCorruptError::EmptyVenueId);
        }
        if !seen.insert(venue_id.clone()) {
            return Err(StoreCorruptError::DuplicateVenueId { venue_id });
        }
        let record: VenueRecord = serde_json::from_value(value).map_err(|source| {
            StoreCorruptError::MalformedRecord {
                venue_id: venue_id.clone(),
                source,
            }
        })?;
        validate_record(&venue_id, &record)?;
        records.insert(venue_id, record);
    }
    Ok(records)
}

fn validate_record(venue_id: &str, record: &VenueRecord) -> Result<(), StoreCorruptError> {
    for (provider_id, field) in &record.refs {
        if provider_id.trim().is_empty() {
            return Err(StoreCorruptError::EmptyProviderKey {
                venue_id: venue_id.to_string(),
            });
        }
        let has_value = field.value.as_deref().is_some_and(|v| !v.trim().is_empty());
        if field.status == ResolutionStatus::Resolved && !has_value {
            return Err(StoreCorruptError::ResolvedWithoutValue {
                venue_id: venue_id.to_string(),
                provider_id: provider_id.clone(),
            });
        }
        if field.provenance == Provenance::Manual && !has_value {
            return Err(StoreCorruptError::ManualWithoutValue {
                venue_id: venue_id.to_string(),
                provider_id: provider_id.clone(),
            });
        }
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` using a sibling temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|err| StoreError::io(format!("creating store directory {}", parent.display()), err))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let write_result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StoreError::io(format!("opening temp store file {}", temp_path.display()), err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| StoreError::io(format!("writing temp store file {}", temp_path.display()), err))?;
        file.flush()
            .await
            .map_err(|err| StoreError::io(format!("flushing temp store file {}", temp_path.display()), err))?;
        file.sync_all()
            .await
            .map_err(|err| StoreError::io(format!("syncing temp store file {}", temp_path.display()), err))?;
        Ok::<(), StoreError>(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(
            format!(
                "atomically renaming temp store {} -> {}",
                temp_path.display(),
                path.display()
            ),
            err,
        ));
    }
    Ok(())
}

/// Exclusive lock held for the duration of a reconciliation run.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    pub fn lock_path_for(store_path: &Path) -> PathBuf {
        let mut name = store_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "store".into());
        name.push(".lock");
        store_path.with_file_name(name)
    }

    pub fn acquire(store_path: &Path, run_id: Uuid) -> Result<Self, StoreError> {
        use std::io::Write;

        let path = Self::lock_path_for(store_path);
        let mut file = match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".to_string());
                return Err(StoreError::Locked {
                    path: path.display().to_string(),
                    holder,
                });
            }
            Err(err) => {
                return Err(StoreError::io(
                    format!("creating lock file {}", path.display()),
                    err,
                ))
            }
        };

        let holder = serde_json::json!({
            "run_id": run_id,
            "pid": std::process::id(),
            "acquired_at": Utc::now(),
        });
        writeln!(file, "{holder}")
            .map_err(|err| StoreError::io(format!("writing lock file {}", path.display()), err))?;
        debug!(path = %path.display(), %run_id, "acquired store lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release store lock");
        }
    }
}

/// How a failed HTTP exchange should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Throttled,
    NotFound,
    Retryable,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    if status == StatusCode::TOO_MANY_REQUESTS {
        FailureClass::Throttled
    } else if status == StatusCode::NOT_FOUND {
        FailureClass::NotFound
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        FailureClass::Retryable
    } else {
        FailureClass::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> FailureClass {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        FailureClass::Retryable
    } else {
        FailureClass::Fatal
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    /// Request pacing for providers whose quotas are tighter than their
    /// concurrency limit suggests.
    pub rate_limits: HashMap<String, TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_provider_concurrency: 4,
            rate_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Evenly spaced requests, no burst.
    pub fn per_minute(requests: u32) -> Self {
        Self {
            capacity: 1,
            refill_every: Duration::from_secs(60) / requests.max(1),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
        class: FailureClass,
    },
    #[error("http status {status} for {path}")]
    HttpStatus {
        status: u16,
        path: String,
        retry_after_secs: Option<u64>,
        body_excerpt: String,
    },
    #[error("http fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Request { class, .. } => *class,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FailureClass::Fatal),
            Self::Closed => FailureClass::Fatal,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::HttpStatus {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(source: reqwest::Error) -> Self {
        let class = classify_reqwest_error(&source);
        Self::Request { source, class }
    }
}

/// Shared HTTP client with global and per-provider concurrency limits.
///
/// Each call is a single attempt; retry policy belongs to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limits: HashMap<String, Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let rate_limits = config
            .rate_limits
            .iter()
            .map(|(provider_id, c)| {
                (
                    provider_id.clone(),
                    Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)),
                )
            })
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            rate_limits,
        })
    }

    pub fn is_rate_limited(&self, provider_id: &str) -> bool {
        self.rate_limits.contains_key(provider_id)
    }

    async fn per_provider_semaphore(&self, provider_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    /// GET `url`, optionally with a bearer token. Query strings are kept out of
    /// the span since they may carry API keys.
    pub async fn get(
        &self,
        provider_id: &str,
        url: reqwest::Url,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_provider = self.per_provider_semaphore(provider_id).await;
        let _provider = per_provider.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = self.rate_limits.get(provider_id) {
            bucket.take().await;
        }

        let path = url.path().to_string();
        let span = info_span!("http_fetch", provider_id, host = url.host_str().unwrap_or(""), path = %path);

        async move {
            let mut request = self.client.get(url);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            let resp = request.send().await?;
            let status = resp.status();

            if status.is_success() {
                let body = resp.bytes().await?.to_vec();
                return Ok(FetchedResponse { body });
            }

            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            let body_excerpt = String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_EXCERPT_BYTES)]).to_string();
            debug!(status = status.as_u16(), ?retry_after_secs, "provider returned error status");
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                path,
                retry_after_secs,
                body_excerpt,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vlr_core::ReferenceField;

    const SAMPLE: &str = r#"{
        "joes-pizza": {
            "name": "Joe's Pizza",
            "address": "12 Main St",
            "refs": {
                "google_maps": {"value": "https://maps.example/joes", "provenance": "manual", "status": "resolved"}
            }
        },
        "blue-door": {"name": "Blue Door Cafe", "address": "5 Elm Rd", "refs": {}}
    }"#;

    async fn write_sample(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("venues.json");
        fs::write(&path, text).await.expect("write sample");
        path
    }

    #[test]
    fn store_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn load_reads_records_in_id_order() {
        let dir = tempdir().expect("tempdir");
        let path = write_sample(dir.path(), SAMPLE).await;
        let store = RecordStore::load(&path).await.expect("load");
        let ids: Vec<_> = store.get_all().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, vec!["blue-door".to_string(), "joes-pizza".to_string()]);
        // restartable
        assert_eq!(store.get_all().count(), 2);
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn duplicate_venue_ids_are_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = write_sample(
            dir.path(),
            r#"{"a": {"name": "One"}, "a": {"name": "Two"}}"#,
        )
        .await;
        let err = RecordStore::load(&path).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Corrupt(StoreCorruptError::DuplicateVenueId { ref venue_id }) if venue_id == "a"
        ));
    }

    #[tokio::test]
    async fn malformed_reference_mapping_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = write_sample(dir.path(), r#"{"a": {"name": "One", "refs": ["nope"]}}"#).await;
        let err = RecordStore::load(&path).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Corrupt(StoreCorruptError::MalformedRecord { .. })
        ));

        let path = write_sample(
            dir.path(),
            r#"{"a": {"name": "One", "refs": {"yelp": {"status": "resolved", "provenance": "auto"}}}}"#,
        )
        .await;
        let err = RecordStore::load(&path).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Corrupt(StoreCorruptError::ResolvedWithoutValue { .. })
        ));
    }

    #[tokio::test]
    async fn apply_refuses_auto_over_manual() {
        let dir = tempdir().expect("tempdir");
        let path = write_sample(dir.path(), SAMPLE).await;
        let mut store = RecordStore::load(&path).await.expect("load");

        let outcome = store.apply(
            "joes-pizza",
            FieldUpdate {
                provider_id: "google_maps".into(),
                field: ReferenceField::auto_resolved("https://other", "other", Utc::now()),
            },
        );
        assert_eq!(outcome, ApplyOutcome::SkippedManual);
        assert!(!store.is_dirty());
        assert_eq!(
            store.get("joes-pizza").unwrap().reference("google_maps").unwrap().value.as_deref(),
            Some("https://maps.example/joes")
        );

        let outcome = store.apply(
            "missing",
            FieldUpdate {
                provider_id: "yelp".into(),
                field: ReferenceField::unresolved(),
            },
        );
        assert_eq!(outcome, ApplyOutcome::UnknownRecord);
    }

    #[tokio::test]
    async fn apply_then_save_round_trips_and_detects_unchanged() {
        let dir = tempdir().expect("tempdir");
        let path = write_sample(dir.path(), SAMPLE).await;
        let mut store = RecordStore::load(&path).await.expect("load");
        let field = ReferenceField::auto_resolved("https://yelp.example/blue", "blue", Utc::now());
        let update = FieldUpdate {
            provider_id: "yelp".into(),
            field: field.clone(),
        };
        assert_eq!(store.apply("blue-door", update.clone()), ApplyOutcome::Applied);
        assert!(store.is_dirty());
        assert_eq!(store.apply("blue-door", update), ApplyOutcome::Unchanged);

        let receipt = store.save().await.expect("save");
        assert!(!store.is_dirty());
        assert_eq!(receipt.content_hash, sha256_hex(&fs::read(&path).await.unwrap()));

        let reloaded = RecordStore::load(&path).await.expect("reload");
        assert_eq!(reloaded.get("blue-door").unwrap().reference("yelp"), Some(&field));
    }

    #[tokio::test]
    async fn unsaved_applies_are_not_visible_after_reload() {
        let dir = tempdir().expect("tempdir");
        let path = write_sample(dir.path(), SAMPLE).await;
        let mut store = RecordStore::load(&path).await.expect("load");

        let first = ReferenceField::auto_resolved("https://a", "a", Utc::now());
        store.apply(
            "blue-door",
            FieldUpdate {
                provider_id: "yelp".into(),
                field: first.clone(),
            },
        );
        store.save().await.expect("save");
        store.apply(
            "blue-door",
            FieldUpdate {
                provider_id: "google_maps".into(),
                field: ReferenceField::auto_resolved("https://b", "b", Utc::now()),
            },
        );

        // a stray temp file from an interrupted write must not affect reloads
        fs::write(dir.path().join(".venues.json.partial.tmp"), b"{\"trunc")
            .await
            .unwrap();

        let reloaded = RecordStore::load(&path).await.expect("reload");
        let record = reloaded.get("blue-door").unwrap();
        assert_eq!(record.reference("yelp"), Some(&first));
        assert!(record.reference("google_maps").is_none());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_dropped() {
        let dir = tempdir().expect("tempdir");
        let path = write_sample(dir.path(), SAMPLE).await;
        let lock = StoreLock::acquire(&path, Uuid::new_v4()).expect("first lock");
        assert!(lock.path().exists());
        let err = StoreLock::acquire(&path, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }));
        drop(lock);
        let again = StoreLock::acquire(&path, Uuid::new_v4()).expect("relock");
        assert!(again.path().ends_with("venues.json.lock"));
    }

    #[test]
    fn status_classification_matches_provider_contract() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureClass::Throttled);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureClass::NotFound);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), FailureClass::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureClass::Fatal);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureClass::Fatal);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_spaces_requests_after_the_burst() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_secs(1));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(10));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn rate_limits_apply_only_to_named_providers() {
        assert_eq!(
            TokenBucketConfig::per_minute(30),
            TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(2),
            }
        );
        let fetcher = HttpFetcher::new(HttpClientConfig {
            rate_limits: HashMap::from([("yelp".to_string(), TokenBucketConfig::per_minute(30))]),
            ..Default::default()
        })
        .expect("fetcher");
        assert!(fetcher.is_rate_limited("yelp"));
        assert!(!fetcher.is_rate_limited("google_maps"));
    }
}
