use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use vlr_core::{AttemptOutcome, CandidateMatch, LookupQuery, Provenance, ResolutionStatus};
use vlr_providers::{FixtureProvider, LookupProvider, ProviderError, ProviderKind, ScriptedProvider};
use vlr_reconcile::{
    identity_fingerprint, CancelHandle, CancelToken, Matcher, Orchestrator, ProviderHandle,
    ProviderSettings, RunSettings, RunSummary,
};
use vlr_storage::{BackoffPolicy, RecordStore, StoreLock};

const JOES_LINK: &str = "https://maps.example/place/ChIJjoes";

fn fast_settings() -> RunSettings {
    RunSettings {
        lookup_timeout: Duration::from_secs(2),
        save_every_merges: 25,
        save_interval: Duration::from_secs(30),
        dry_run: false,
        retry: vlr_reconcile::RetryPolicy {
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            max_throttle_requeues: 3,
            max_throttle_wait: Duration::from_millis(50),
        },
    }
}

fn write_store(dir: &Path, json: &str) -> PathBuf {
    let path = dir.join("venues.json");
    std::fs::write(&path, json).unwrap();
    path
}

fn joes_candidates(provider_id: &str) -> Vec<CandidateMatch> {
    vec![
        CandidateMatch::new(provider_id, "ChIJjoes", "Joe's Pizza")
            .with_address("12 Main St, Springfield")
            .with_link(JOES_LINK),
        CandidateMatch::new(provider_id, "ChIJpizzeria", "Joe's Pizzeria")
            .with_address("400 Oak Ave, Springfield"),
    ]
}

fn handle(provider: Arc<dyn LookupProvider>, settings: ProviderSettings) -> ProviderHandle {
    ProviderHandle::new(provider, settings)
}

fn single(provider: Arc<ScriptedProvider>, concurrency: usize) -> Vec<ProviderHandle> {
    vec![handle(
        provider,
        ProviderSettings {
            concurrency,
            ..Default::default()
        },
    )]
}

async fn run(
    path: &Path,
    providers: Vec<ProviderHandle>,
    settings: RunSettings,
) -> (RecordStore, RunSummary) {
    let store = RecordStore::load(path).await.unwrap();
    Orchestrator::new(providers, Matcher::default(), settings)
        .run(store, CancelToken::never())
        .await
        .unwrap()
}

#[tokio::test]
async fn joes_pizza_resolves_to_the_exact_candidate_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{"joes-pizza": {"name": "Joe's Pizza", "address": "12 Main St", "curator": "ops"}}"#,
    );
    let provider = Arc::new(
        ScriptedProvider::new("google_maps").script("joes-pizza", vec![Ok(joes_candidates("google_maps"))]),
    );

    let (_, summary) = run(&path, single(provider.clone(), 2), fast_settings()).await;
    assert_eq!(summary.counters("google_maps").accepted, 1);
    assert_eq!(summary.saves, 1);

    let reloaded = RecordStore::load(&path).await.unwrap();
    let record = reloaded.get("joes-pizza").unwrap();
    let field = record.reference("google_maps").unwrap();
    assert_eq!(field.value.as_deref(), Some(JOES_LINK));
    assert_eq!(field.native_id.as_deref(), Some("ChIJjoes"));
    assert_eq!(field.status, ResolutionStatus::Resolved);
    assert_eq!(field.provenance, Provenance::Auto);
    assert!(field.resolved_at.is_some());
    assert_eq!(
        field.identity_fingerprint.as_deref(),
        Some(identity_fingerprint(&record.lookup_query("joes-pizza")).as_str())
    );
    assert_eq!(record.extra.get("curator").and_then(|v| v.as_str()), Some("ops"));
}

#[tokio::test]
async fn second_pass_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{
            "joes-pizza": {"name": "Joe's Pizza", "address": "12 Main St"},
            "curated": {"name": "Blue Door Cafe", "refs": {"google_maps": {"value": "https://maps.example/blue"}}}
        }"#,
    );
    let provider = Arc::new(
        ScriptedProvider::new("google_maps").script("joes-pizza", vec![Ok(joes_candidates("google_maps"))]),
    );

    let (_, first) = run(&path, single(provider.clone(), 2), fast_settings()).await;
    assert_eq!(first.counters("google_maps").accepted, 1);
    let after_first = std::fs::read(&path).unwrap();

    let (_, summary) = run(&path, single(provider.clone(), 2), fast_settings()).await;
    let counters = summary.counters("google_maps");
    assert_eq!(counters.accepted, 0);
    assert_eq!(counters.skipped_fresh, 1);
    assert_eq!(summary.saves, 0);
    assert_eq!(std::fs::read(&path).unwrap(), after_first);
    assert_eq!(provider.calls_for("joes-pizza"), 1);
}

#[tokio::test]
async fn manual_fields_are_never_queried_or_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{
            "joes-pizza": {
                "name": "Joe's Pizza",
                "address": "12 Main St",
                "refs": {"google_maps": {"value": "https://maps.example/curated"}}
            }
        }"#,
    );
    let provider = Arc::new(
        ScriptedProvider::new("google_maps").script("joes-pizza", vec![Ok(joes_candidates("google_maps"))]),
    );

    let (store, summary) = run(&path, single(provider.clone(), 2), fast_settings()).await;
    assert_eq!(summary.counters("google_maps").skipped_manual, 1);
    assert_eq!(provider.total_calls(), 0);

    let field = store.get("joes-pizza").unwrap().reference("google_maps").unwrap();
    assert_eq!(field.value.as_deref(), Some("https://maps.example/curated"));
    assert_eq!(field.provenance, Provenance::Manual);
}

#[tokio::test]
async fn throttled_lookups_are_requeued_and_complete() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(dir.path(), r#"{"joes-pizza": {"name": "Joe's Pizza", "address": "12 Main St"}}"#);
    let provider = Arc::new(ScriptedProvider::new("google_maps").script(
        "joes-pizza",
        vec![
            Err(ProviderError::Throttled { retry_after_secs: 0 }),
            Err(ProviderError::Throttled { retry_after_secs: 0 }),
            Ok(joes_candidates("google_maps")),
        ],
    ));

    let (store, summary) = run(&path, single(provider.clone(), 1), fast_settings()).await;
    let counters = summary.counters("google_maps");
    assert_eq!(counters.accepted, 1);
    assert_eq!(counters.throttled, 2);
    assert_eq!(counters.errored, 0);
    assert_eq!(provider.calls_for("joes-pizza"), 3);
    let field = store.get("joes-pizza").unwrap().reference("google_maps").unwrap();
    assert_eq!(field.value.as_deref(), Some(JOES_LINK));
}

#[tokio::test]
async fn exhausted_transient_failures_leave_the_field_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(dir.path(), r#"{"joes-pizza": {"name": "Joe's Pizza", "address": "12 Main St"}}"#);
    let provider = Arc::new(
        ScriptedProvider::new("google_maps")
            .script("joes-pizza", vec![Err(ProviderError::Transient("503".to_string()))]),
    );

    let (store, summary) = run(&path, single(provider.clone(), 1), fast_settings()).await;
    let counters = summary.counters("google_maps");
    assert_eq!(counters.errored, 1);
    assert_eq!(counters.retries, 2);
    assert_eq!(provider.calls_for("joes-pizza"), 3);
    assert_eq!(summary.errored.len(), 1);
    assert!(store.get("joes-pizza").unwrap().reference("google_maps").is_none());
    assert_eq!(summary.saves, 0);
}

#[tokio::test]
async fn fatal_error_disables_only_that_provider() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{
            "a-venue": {"name": "Joe's Pizza", "address": "12 Main St"},
            "b-venue": {"name": "Blue Door Cafe", "address": "5 Elm Rd"},
            "c-venue": {"name": "Corner Deli", "address": "9 Pine St"}
        }"#,
    );
    let fatal = || vec![Err(ProviderError::Fatal("invalid api key".to_string()))];
    let broken = Arc::new(
        ScriptedProvider::new("yelp")
            .script("a-venue", fatal())
            .script("b-venue", fatal())
            .script("c-venue", fatal()),
    );
    let healthy = Arc::new(
        ScriptedProvider::new("google_maps").script("a-venue", vec![Ok(joes_candidates("google_maps"))]),
    );
    let providers = vec![
        handle(
            broken.clone(),
            ProviderSettings {
                concurrency: 1,
                ..Default::default()
            },
        ),
        handle(healthy.clone(), ProviderSettings::default()),
    ];

    let (_, summary) = run(&path, providers, fast_settings()).await;
    let yelp = summary.counters("yelp");
    assert_eq!(yelp.errored, 1);
    assert_eq!(yelp.skipped_disabled, 2);
    assert_eq!(broken.total_calls(), 1);
    assert_eq!(summary.disabled_providers, vec!["yelp".to_string()]);

    let google = summary.counters("google_maps");
    assert_eq!(google.accepted, 1);
    assert_eq!(google.rejected, 2);
    assert_eq!(healthy.total_calls(), 3);
}

#[tokio::test]
async fn cancelled_run_issues_no_new_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{
            "a-venue": {"name": "A"},
            "b-venue": {"name": "B"},
            "c-venue": {"name": "C"}
        }"#,
    );
    let provider = Arc::new(ScriptedProvider::new("google_maps"));
    let cancel = CancelHandle::new();
    cancel.cancel();

    let store = RecordStore::load(&path).await.unwrap();
    let (_, summary) = Orchestrator::new(single(provider.clone(), 2), Matcher::default(), fast_settings())
        .run(store, cancel.token())
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.counters("google_maps").cancelled, 3);
    assert_eq!(provider.total_calls(), 0);
}

#[tokio::test]
async fn cancelling_mid_run_lets_in_flight_lookups_finish() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{
            "a-venue": {"name": "A"},
            "b-venue": {"name": "B"},
            "c-venue": {"name": "C"},
            "d-venue": {"name": "D"},
            "e-venue": {"name": "E"},
            "f-venue": {"name": "F"}
        }"#,
    );
    let provider = Arc::new(ScriptedProvider::new("google_maps").with_delay(Duration::from_millis(100)));
    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let store = RecordStore::load(&path).await.unwrap();
    let (_, summary) = Orchestrator::new(single(provider.clone(), 1), Matcher::default(), fast_settings())
        .run(store, cancel.token())
        .await
        .unwrap();
    let counters = summary.counters("google_maps");
    assert!(summary.cancelled);
    assert!(counters.cancelled >= 3);
    assert_eq!(counters.rejected + counters.cancelled, 6);
    assert_eq!(provider.total_calls(), counters.rejected);
}

#[tokio::test]
async fn recent_failures_sit_out_the_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let attempted = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
    let path = write_store(
        dir.path(),
        &format!(
            r#"{{"nowhere": {{"name": "Nowhere Diner", "refs": {{"google_maps": {{"status": "unresolved", "last_attempted_at": "{attempted}", "last_outcome": "not_found"}}}}}}}}"#
        ),
    );
    let provider = Arc::new(ScriptedProvider::new("google_maps"));
    let providers = vec![handle(
        provider.clone(),
        ProviderSettings {
            cooldown: Some(chrono::Duration::hours(24)),
            ..Default::default()
        },
    )];

    let (_, summary) = run(&path, providers, fast_settings()).await;
    assert_eq!(summary.counters("google_maps").skipped_cooldown, 1);
    assert_eq!(provider.total_calls(), 0);
}

#[tokio::test]
async fn identity_change_marks_resolution_stale_and_requeries() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{
            "joes-pizza": {
                "name": "Joe's Pizza",
                "address": "14 Harbor Blvd",
                "refs": {"google_maps": {
                    "value": "https://maps.example/place/old",
                    "native_id": "old",
                    "status": "resolved",
                    "provenance": "auto",
                    "resolved_at": "2025-01-01T00:00:00Z",
                    "identity_fingerprint": "fingerprint-from-the-old-address"
                }}
            }
        }"#,
    );
    let provider = Arc::new(ScriptedProvider::new("google_maps"));

    let (store, summary) = run(&path, single(provider.clone(), 1), fast_settings()).await;
    assert_eq!(summary.counters("google_maps").rejected, 1);
    assert_eq!(provider.calls_for("joes-pizza"), 1);

    let field = store.get("joes-pizza").unwrap().reference("google_maps").unwrap();
    assert_eq!(field.status, ResolutionStatus::Stale);
    assert_eq!(field.value.as_deref(), Some("https://maps.example/place/old"));
    assert_eq!(field.last_outcome, Some(AttemptOutcome::NotFound));
}

#[tokio::test]
async fn near_identical_candidates_are_left_for_review() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{"twin-tacos": {"name": "Twin Tacos", "address": "77 River St"}}"#,
    );
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/providers/google_maps.json");
    let provider = Arc::new(FixtureProvider::from_path("google_maps", fixture).unwrap());

    let (store, summary) = run(
        &path,
        vec![handle(provider, ProviderSettings::default())],
        fast_settings(),
    )
    .await;
    assert_eq!(summary.counters("google_maps").ambiguous, 1);
    assert_eq!(summary.review.len(), 1);
    assert_eq!(summary.review[0].candidates.len(), 2);

    let field = store.get("twin-tacos").unwrap().reference("google_maps").unwrap();
    assert_eq!(field.status, ResolutionStatus::Ambiguous);
    assert_eq!(field.value, None);
    assert_eq!(field.candidate_count, Some(2));
}

const MOVED_JOES: &str = r#"{
    "joes-pizza": {
        "name": "Joe's Pizza",
        "address": "14 Harbor Blvd",
        "refs": {"google_maps": {
            "value": "https://maps.example/place/old",
            "native_id": "old",
            "status": "resolved",
            "provenance": "auto",
            "resolved_at": "2025-01-01T00:00:00Z",
            "identity_fingerprint": "fingerprint-from-the-old-address"
        }}
    }
}"#;

#[tokio::test]
async fn stale_field_sits_out_the_cooldown_on_the_next_pass() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(dir.path(), MOVED_JOES);
    let provider = Arc::new(ScriptedProvider::new("google_maps"));
    let providers = || {
        vec![handle(
            provider.clone(),
            ProviderSettings {
                concurrency: 1,
                cooldown: Some(chrono::Duration::hours(24)),
                ..Default::default()
            },
        )]
    };

    let (_, first) = run(&path, providers(), fast_settings()).await;
    assert_eq!(first.counters("google_maps").rejected, 1);
    let after_first = std::fs::read(&path).unwrap();

    let (_, second) = run(&path, providers(), fast_settings()).await;
    assert_eq!(second.counters("google_maps").skipped_cooldown, 1);
    assert_eq!(second.saves, 0);
    assert_eq!(provider.calls_for("joes-pizza"), 1);
    assert_eq!(std::fs::read(&path).unwrap(), after_first);
}

#[tokio::test]
async fn repeated_rejection_of_a_stale_field_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(dir.path(), MOVED_JOES);
    let provider = Arc::new(ScriptedProvider::new("google_maps"));

    run(&path, single(provider.clone(), 1), fast_settings()).await;
    let after_first = std::fs::read(&path).unwrap();

    let (_, second) = run(&path, single(provider.clone(), 1), fast_settings()).await;
    assert_eq!(provider.calls_for("joes-pizza"), 2);
    assert_eq!(second.counters("google_maps").rejected, 1);
    assert_eq!(second.saves, 0);
    assert_eq!(std::fs::read(&path).unwrap(), after_first);
}

#[tokio::test]
async fn repeated_ambiguity_changes_nothing_but_stays_in_review() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{"twin-tacos": {"name": "Twin Tacos", "address": "77 River St"}}"#,
    );
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/providers/google_maps.json");
    let provider: Arc<dyn LookupProvider> = Arc::new(FixtureProvider::from_path("google_maps", fixture).unwrap());

    let (_, first) = run(
        &path,
        vec![handle(provider.clone(), ProviderSettings::default())],
        fast_settings(),
    )
    .await;
    assert_eq!(first.saves, 1);
    let after_first = std::fs::read(&path).unwrap();

    let (_, second) = run(
        &path,
        vec![handle(provider, ProviderSettings::default())],
        fast_settings(),
    )
    .await;
    assert_eq!(second.counters("google_maps").ambiguous, 1);
    assert_eq!(second.review.len(), 1);
    assert_eq!(second.saves, 0);
    assert_eq!(std::fs::read(&path).unwrap(), after_first);
}

#[tokio::test]
async fn store_is_saved_every_k_merges_and_once_at_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let names = ["a", "b", "c", "d", "e"];
    let body = names
        .iter()
        .map(|n| format!(r#""{n}": {{"name": "Venue {n}"}}"#))
        .collect::<Vec<_>>()
        .join(",");
    let path = write_store(dir.path(), &format!("{{{body}}}"));
    let mut provider = ScriptedProvider::new("google_maps");
    for n in names {
        provider = provider.script(
            n,
            vec![Ok(vec![CandidateMatch::new("google_maps", format!("id-{n}"), format!("Venue {n}"))])],
        );
    }
    let provider = Arc::new(provider);
    let settings = RunSettings {
        save_every_merges: 2,
        ..fast_settings()
    };

    let (_, summary) = run(&path, single(provider, 1), settings).await;
    assert_eq!(summary.counters("google_maps").accepted, 5);
    assert_eq!(summary.saves, 3);

    let reloaded = RecordStore::load(&path).await.unwrap();
    for n in names {
        let field = reloaded.get(n).unwrap().reference("google_maps").unwrap();
        assert_eq!(field.native_id.as_deref(), Some(format!("id-{n}").as_str()));
    }
}

/// Hangs on one venue so a run can be killed with earlier merges saved.
struct StallingProvider {
    inner: ScriptedProvider,
    stall_on: &'static str,
}

#[async_trait]
impl LookupProvider for StallingProvider {
    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Fixture
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<Vec<CandidateMatch>, ProviderError> {
        if query.venue_id == self.stall_on {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.inner.lookup(query).await
    }
}

#[tokio::test]
async fn killed_run_keeps_exactly_the_saved_merges() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(
        dir.path(),
        r#"{"a": {"name": "Venue a"}, "b": {"name": "Venue b"}, "c": {"name": "Venue c"}}"#,
    );
    let mut inner = ScriptedProvider::new("google_maps");
    for n in ["a", "b", "c"] {
        inner = inner.script(
            n,
            vec![Ok(vec![CandidateMatch::new("google_maps", format!("id-{n}"), format!("Venue {n}"))])],
        );
    }
    let provider = Arc::new(StallingProvider {
        inner,
        stall_on: "c",
    });
    let settings = RunSettings {
        save_every_merges: 2,
        ..fast_settings()
    };
    let store = RecordStore::load(&path).await.unwrap();
    let run = tokio::spawn(async move {
        Orchestrator::new(
            vec![handle(provider, ProviderSettings { concurrency: 1, ..Default::default() })],
            Matcher::default(),
            settings,
        )
        .run(store, CancelToken::never())
        .await
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let saved = RecordStore::load(&path).await.unwrap();
        if saved.get("b").and_then(|r| r.reference("google_maps")).is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "first batch never saved");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    run.abort();
    let _ = run.await;

    let reloaded = RecordStore::load(&path).await.unwrap();
    for n in ["a", "b"] {
        let field = reloaded.get(n).unwrap().reference("google_maps").unwrap();
        assert_eq!(field.status, ResolutionStatus::Resolved);
    }
    assert!(reloaded.get("c").unwrap().reference("google_maps").is_none());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name != "venues.json")
        .collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
}

#[tokio::test]
async fn dry_run_leaves_the_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(dir.path(), r#"{"joes-pizza": {"name": "Joe's Pizza", "address": "12 Main St"}}"#);
    let before = std::fs::read(&path).unwrap();
    let provider = Arc::new(
        ScriptedProvider::new("google_maps").script("joes-pizza", vec![Ok(joes_candidates("google_maps"))]),
    );
    let settings = RunSettings {
        dry_run: true,
        ..fast_settings()
    };

    let (store, summary) = run(&path, single(provider, 1), settings).await;
    assert_eq!(summary.counters("google_maps").accepted, 1);
    assert_eq!(summary.saves, 0);
    assert!(store.is_dirty());
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn held_lock_blocks_a_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_store(dir.path(), r#"{"joes-pizza": {"name": "Joe's Pizza"}}"#);
    let _held = StoreLock::acquire(&path, uuid::Uuid::new_v4()).unwrap();
    std::fs::write(dir.path().join("providers.yaml"), "providers: []\n").unwrap();

    let pipeline = vlr_reconcile::ReconcilePipeline::new(vlr_reconcile::ReconcileConfig {
        store_path: path.clone(),
        workspace_root: dir.path().to_path_buf(),
        providers_file: PathBuf::from("providers.yaml"),
        user_agent: "vlr-test/0.1".to_string(),
        http_timeout_secs: 5,
        lookup_timeout_secs: 5,
        save_every_merges: 25,
        save_interval_secs: 30,
        scheduler_enabled: false,
        reconcile_cron: "0 0 5 * * *".to_string(),
        dry_run: false,
    })
    .unwrap();
    let err = pipeline.run_once(CancelToken::never()).await.unwrap_err();
    assert!(format!("{err:#}").contains("locked by another run"));
}
