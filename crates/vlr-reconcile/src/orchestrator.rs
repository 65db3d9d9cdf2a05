//! Drives lookups across providers and funnels every result through a single
//! merge writer that owns the record store.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use vlr_core::{
    CandidateMatch, FieldUpdate, LookupQuery, MatchDecision, ProviderId, ReferenceField,
    ResolutionStatus, VenueId,
};
use vlr_providers::{LookupProvider, ProviderError};
use vlr_storage::{ApplyOutcome, RecordStore, StoreError};

use crate::matcher::Matcher;
use crate::merge::{identity_fingerprint, plan_merge, MergeContext, MergeOutcome};
use crate::report::{ErroredItem, ProviderCounters, ReviewCandidate, ReviewItem, RunSummary};
use crate::retry::{LookupFailure, LookupMachine, LookupStep, PairState, RetryPolicy};

/// Owner side of a run's cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        CancelHandle::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&mut self) {
        // A dropped sender means nobody can cancel any more.
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Provider-wide throttle cool-down and disable switch shared by all of that
/// provider's workers.
#[derive(Debug, Default)]
pub struct ProviderGate {
    disabled: AtomicBool,
    cooldown_until: Mutex<Option<Instant>>,
}

impl ProviderGate {
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that flipped the switch.
    pub fn disable(&self) -> bool {
        !self.disabled.swap(true, Ordering::SeqCst)
    }

    pub async fn throttle(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut current = self.cooldown_until.lock().await;
        if current.map_or(true, |existing| existing < until) {
            *current = Some(until);
        }
    }

    /// Wait out any cool-down. Returns false if cancelled while waiting.
    pub async fn wait_ready(&self, cancel: &mut CancelToken) -> bool {
        loop {
            let until = *self.cooldown_until.lock().await;
            match until {
                Some(until) if until > Instant::now() => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(until) => {}
                        _ = cancel.cancelled() => return false,
                    }
                }
                _ => return true,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderSettings {
    pub concurrency: usize,
    /// Skip unresolved, ambiguous or stale fields attempted more recently than this.
    pub cooldown: Option<chrono::Duration>,
    /// Re-query automatic resolutions older than this.
    pub refresh_after: Option<chrono::Duration>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            cooldown: None,
            refresh_after: None,
        }
    }
}

#[derive(Clone)]
pub struct ProviderHandle {
    pub provider: Arc<dyn LookupProvider>,
    pub settings: ProviderSettings,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn LookupProvider>, settings: ProviderSettings) -> Self {
        Self { provider, settings }
    }

    pub fn provider_id(&self) -> &str {
        self.provider.provider_id()
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub lookup_timeout: Duration,
    pub save_every_merges: usize,
    pub save_interval: Duration,
    pub dry_run: bool,
    pub retry: RetryPolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_secs(30),
            save_every_merges: 25,
            save_interval: Duration::from_secs(30),
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Pre-query verdict for one (record, provider) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Query { stale: bool },
    SkipManual,
    SkipFresh,
    SkipCooldown,
}

pub fn pair_eligibility(
    existing: Option<&ReferenceField>,
    fingerprint: &str,
    settings: &ProviderSettings,
    now: DateTime<Utc>,
) -> Eligibility {
    let Some(field) = existing else {
        return Eligibility::Query { stale: false };
    };
    if field.is_manual() {
        return Eligibility::SkipManual;
    }
    match field.status {
        ResolutionStatus::Resolved => {
            let identity_changed = field
                .identity_fingerprint
                .as_deref()
                .is_some_and(|recorded| recorded != fingerprint);
            let aged_out = settings.refresh_after.is_some_and(|max_age| {
                field
                    .resolved_at
                    .map_or(true, |resolved_at| now - resolved_at >= max_age)
            });
            if identity_changed || aged_out {
                Eligibility::Query { stale: true }
            } else {
                Eligibility::SkipFresh
            }
        }
        ResolutionStatus::Stale => {
            // A stale field whose identity moved again since the last attempt
            // is re-queried regardless of the cool-down.
            let same_identity = field
                .identity_fingerprint
                .as_deref()
                .map_or(true, |recorded| recorded == fingerprint);
            if same_identity && cooling_down(field, settings, now) {
                Eligibility::SkipCooldown
            } else {
                Eligibility::Query { stale: true }
            }
        }
        ResolutionStatus::Unresolved | ResolutionStatus::Ambiguous => {
            if cooling_down(field, settings, now) {
                Eligibility::SkipCooldown
            } else {
                Eligibility::Query { stale: false }
            }
        }
    }
}

fn cooling_down(field: &ReferenceField, settings: &ProviderSettings, now: DateTime<Utc>) -> bool {
    settings.cooldown.is_some_and(|cooldown| {
        field
            .last_attempted_at
            .is_some_and(|attempted| now - attempted < cooldown)
    })
}

#[derive(Debug, Clone)]
struct Target {
    query: LookupQuery,
    fingerprint: String,
    stale: bool,
    cooldown: Option<chrono::Duration>,
}

#[derive(Debug)]
enum PairResolution {
    Decided(MatchDecision),
    Errored(LookupFailure),
    Cancelled,
    SkippedDisabled,
}

#[derive(Debug)]
struct PairResult {
    venue_id: VenueId,
    provider_id: ProviderId,
    fingerprint: String,
    stale: bool,
    cooldown: Option<chrono::Duration>,
    resolution: PairResolution,
    retries: usize,
    throttles: usize,
}

impl PairResult {
    fn without_lookup(provider_id: &str, target: Target, resolution: PairResolution) -> Self {
        Self {
            venue_id: target.query.venue_id,
            provider_id: provider_id.to_string(),
            fingerprint: target.fingerprint,
            stale: target.stale,
            cooldown: target.cooldown,
            resolution,
            retries: 0,
            throttles: 0,
        }
    }
}

enum LookupEnd {
    Candidates(Vec<CandidateMatch>),
    Failed(LookupFailure),
    Cancelled,
    Disabled,
}

#[derive(Clone)]
struct Worker {
    provider: Arc<dyn LookupProvider>,
    gate: Arc<ProviderGate>,
    matcher: Arc<Matcher>,
    policy: RetryPolicy,
    lookup_timeout: Duration,
    cancel: CancelToken,
}

impl Worker {
    async fn run(mut self, target: Target) -> PairResult {
        let mut machine = LookupMachine::new(self.policy);
        let end = self.drive(&mut machine, &target.query).await;
        let provider_id = self.provider.provider_id().to_string();
        let resolution = match end {
            LookupEnd::Candidates(candidates) => {
                let decision = self.matcher.decide(&target.query, &candidates);
                machine.settle(match &decision {
                    MatchDecision::Accept { .. } => PairState::Accepted,
                    MatchDecision::Reject { .. } => PairState::Rejected,
                    MatchDecision::Ambiguous { .. } => PairState::Ambiguous,
                });
                PairResolution::Decided(decision)
            }
            LookupEnd::Failed(failure) => PairResolution::Errored(failure),
            LookupEnd::Cancelled => {
                machine.settle(PairState::Cancelled);
                PairResolution::Cancelled
            }
            LookupEnd::Disabled => {
                machine.settle(PairState::Skipped);
                PairResolution::SkippedDisabled
            }
        };
        debug!(
            provider_id = %provider_id,
            venue_id = %target.query.venue_id,
            state = ?machine.state(),
            attempts = machine.attempts(),
            "pair finished"
        );
        PairResult {
            venue_id: target.query.venue_id,
            provider_id,
            fingerprint: target.fingerprint,
            stale: target.stale,
            cooldown: target.cooldown,
            resolution,
            retries: machine.retries(),
            throttles: machine.throttles(),
        }
    }

    async fn drive(&mut self, machine: &mut LookupMachine, query: &LookupQuery) -> LookupEnd {
        let mut step = machine.start();
        loop {
            step = match step {
                LookupStep::Query { attempt } => {
                    if self.cancel.is_cancelled() {
                        return LookupEnd::Cancelled;
                    }
                    if self.gate.is_disabled() {
                        return LookupEnd::Disabled;
                    }
                    if !self.gate.wait_ready(&mut self.cancel).await {
                        return LookupEnd::Cancelled;
                    }
                    let span = info_span!(
                        "lookup",
                        provider_id = self.provider.provider_id(),
                        venue_id = %query.venue_id,
                        attempt
                    );
                    let result = match tokio::time::timeout(
                        self.lookup_timeout,
                        self.provider.lookup(query),
                    )
                    .instrument(span)
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Transient(format!(
                            "lookup timed out after {:?}",
                            self.lookup_timeout
                        ))),
                    };
                    match &result {
                        Err(ProviderError::Throttled { retry_after_secs }) => {
                            let delay = Duration::from_secs(*retry_after_secs)
                                .min(self.policy.max_throttle_wait);
                            self.gate.throttle(delay).await;
                        }
                        Err(ProviderError::Fatal(msg)) => {
                            if self.gate.disable() {
                                warn!(
                                    provider_id = self.provider.provider_id(),
                                    error = %msg,
                                    "provider disabled for the rest of the run"
                                );
                            }
                        }
                        _ => {}
                    }
                    machine.on_result(result)
                }
                LookupStep::Wait { delay, throttled } => {
                    // Throttle waits happen on the provider gate before the next query.
                    if !throttled {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => return LookupEnd::Cancelled,
                        }
                    }
                    machine.resume()
                }
                LookupStep::Done(Ok(candidates)) => return LookupEnd::Candidates(candidates),
                LookupStep::Done(Err(failure)) => return LookupEnd::Failed(failure),
            };
        }
    }
}

/// Coordinates one reconciliation pass over a record store.
pub struct Orchestrator {
    providers: Vec<ProviderHandle>,
    matcher: Arc<Matcher>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(providers: Vec<ProviderHandle>, matcher: Matcher, settings: RunSettings) -> Self {
        Self {
            providers,
            matcher: Arc::new(matcher),
            settings,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers
            .iter()
            .map(|p| p.provider_id().to_string())
            .collect()
    }

    /// Run one pass. Provider failures are counted, never returned; only
    /// store failures abort the run, and saves made before the abort stay on
    /// disk.
    pub async fn run(
        &self,
        store: RecordStore,
        cancel: CancelToken,
    ) -> Result<(RecordStore, RunSummary), StoreError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id);
        self.run_with_id(run_id, store, cancel).instrument(span).await
    }

    pub async fn run_with_id(
        &self,
        run_id: Uuid,
        mut store: RecordStore,
        cancel: CancelToken,
    ) -> Result<(RecordStore, RunSummary), StoreError> {
        let started_at = Utc::now();
        let mut counters: BTreeMap<ProviderId, ProviderCounters> = BTreeMap::new();
        let mut pending_saves = 0usize;

        let mut plans = Vec::with_capacity(self.providers.len());
        for handle in &self.providers {
            let provider_id = handle.provider_id().to_string();
            let entry = counters.entry(provider_id.clone()).or_default();
            let (targets, stale_updates) = self.plan_targets(&store, handle, entry, started_at);
            for (venue_id, update) in stale_updates {
                if store.apply(&venue_id, update) == ApplyOutcome::Applied {
                    pending_saves += 1;
                }
            }
            plans.push((handle.clone(), targets));
        }
        info!(
            records = store.len(),
            providers = self.providers.len(),
            queued = plans.iter().map(|(_, t)| t.len()).sum::<usize>(),
            "reconciliation pass started"
        );

        let (tx, mut rx) = mpsc::channel::<PairResult>(256);
        let mut gates = Vec::with_capacity(plans.len());
        let mut dispatchers = JoinSet::new();
        for (handle, targets) in plans {
            let gate = Arc::new(ProviderGate::default());
            gates.push((handle.provider_id().to_string(), gate.clone()));
            let worker = Worker {
                provider: handle.provider.clone(),
                gate,
                matcher: self.matcher.clone(),
                policy: self.settings.retry,
                lookup_timeout: self.settings.lookup_timeout,
                cancel: cancel.clone(),
            };
            dispatchers.spawn(dispatch(
                worker,
                handle.settings.concurrency,
                targets,
                tx.clone(),
            ));
        }
        drop(tx);

        let mut writer = MergeWriter {
            store,
            counters,
            review: Vec::new(),
            errored: Vec::new(),
            merged: HashSet::new(),
            pending_saves,
            saves: 0,
            save_every: self.settings.save_every_merges.max(1),
            dry_run: self.settings.dry_run,
        };

        let mut ticker = tokio::time::interval(self.settings.save_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(result) => writer.absorb(result).await?,
                    None => break,
                },
                _ = ticker.tick() => {
                    if writer.pending_saves > 0 {
                        writer.save().await?;
                    }
                }
            }
        }
        while dispatchers.join_next().await.is_some() {}
        if writer.store.is_dirty() {
            writer.save().await?;
        }

        let disabled_providers = gates
            .iter()
            .filter(|(_, gate)| gate.is_disabled())
            .map(|(id, _)| id.clone())
            .collect();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            store_path: writer.store.path().display().to_string(),
            records: writer.store.len(),
            dry_run: self.settings.dry_run,
            cancelled: cancel.is_cancelled(),
            saves: writer.saves,
            providers: writer.counters,
            disabled_providers,
            review: writer.review,
            errored: writer.errored,
        };
        let totals = summary.totals();
        info!(
            accepted = totals.accepted,
            unchanged = totals.unchanged,
            rejected = totals.rejected,
            ambiguous = totals.ambiguous,
            errored = totals.errored,
            skipped_manual = totals.skipped_manual,
            saves = summary.saves,
            cancelled = summary.cancelled,
            "reconciliation pass finished"
        );
        Ok((writer.store, summary))
    }

    fn plan_targets(
        &self,
        store: &RecordStore,
        handle: &ProviderHandle,
        counters: &mut ProviderCounters,
        now: DateTime<Utc>,
    ) -> (Vec<Target>, Vec<(VenueId, FieldUpdate)>) {
        let provider_id = handle.provider_id();
        let mut targets = Vec::new();
        let mut stale_updates = Vec::new();
        for (venue_id, record) in store.get_all() {
            let query = record.lookup_query(venue_id);
            let fingerprint = identity_fingerprint(&query);
            let existing = record.reference(provider_id);
            match pair_eligibility(existing, &fingerprint, &handle.settings, now) {
                Eligibility::SkipManual => counters.skipped_manual += 1,
                Eligibility::SkipFresh => counters.skipped_fresh += 1,
                Eligibility::SkipCooldown => counters.skipped_cooldown += 1,
                Eligibility::Query { stale } => {
                    if let Some(field) = existing.filter(|f| stale && f.status != ResolutionStatus::Stale) {
                        stale_updates.push((
                            venue_id.clone(),
                            FieldUpdate {
                                provider_id: provider_id.to_string(),
                                field: ReferenceField {
                                    status: ResolutionStatus::Stale,
                                    ..field.clone()
                                },
                            },
                        ));
                    }
                    targets.push(Target {
                        query,
                        fingerprint,
                        stale,
                        cooldown: handle.settings.cooldown,
                    });
                }
            }
        }
        (targets, stale_updates)
    }
}

async fn dispatch(worker: Worker, concurrency: usize, targets: Vec<Target>, tx: mpsc::Sender<PairResult>) {
    let provider_id = worker.provider.provider_id().to_string();
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    for target in targets {
        if worker.cancel.is_cancelled() {
            let _ = tx
                .send(PairResult::without_lookup(&provider_id, target, PairResolution::Cancelled))
                .await;
            continue;
        }
        if worker.gate.is_disabled() {
            let _ = tx
                .send(PairResult::without_lookup(&provider_id, target, PairResolution::SkippedDisabled))
                .await;
            continue;
        }
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let worker = worker.clone();
        let tx = tx.clone();
        in_flight.spawn(async move {
            let result = worker.run(target).await;
            drop(permit);
            let _ = tx.send(result).await;
        });
    }
    while in_flight.join_next().await.is_some() {}
}

struct MergeWriter {
    store: RecordStore,
    counters: BTreeMap<ProviderId, ProviderCounters>,
    review: Vec<ReviewItem>,
    errored: Vec<ErroredItem>,
    merged: HashSet<(VenueId, ProviderId)>,
    pending_saves: usize,
    saves: usize,
    save_every: usize,
    dry_run: bool,
}

impl MergeWriter {
    async fn absorb(&mut self, result: PairResult) -> Result<(), StoreError> {
        let counters = self.counters.entry(result.provider_id.clone()).or_default();
        counters.retries += result.retries;
        counters.throttled += result.throttles;

        let decision = match result.resolution {
            PairResolution::Decided(decision) => decision,
            PairResolution::Errored(failure) => {
                counters.errored += 1;
                warn!(
                    venue_id = %result.venue_id,
                    provider_id = %result.provider_id,
                    error = %failure,
                    "lookup failed; field left untouched"
                );
                self.errored.push(ErroredItem {
                    venue_id: result.venue_id,
                    provider_id: result.provider_id,
                    error: failure.to_string(),
                });
                return Ok(());
            }
            PairResolution::Cancelled => {
                counters.cancelled += 1;
                return Ok(());
            }
            PairResolution::SkippedDisabled => {
                counters.skipped_disabled += 1;
                return Ok(());
            }
        };

        let key = (result.venue_id.clone(), result.provider_id.clone());
        if !self.merged.insert(key) {
            counters.conflicts += 1;
            warn!(
                venue_id = %result.venue_id,
                provider_id = %result.provider_id,
                "second decision for an already merged pair dropped"
            );
            return Ok(());
        }

        let plan = {
            let existing = self
                .store
                .get(&result.venue_id)
                .and_then(|record| record.reference(&result.provider_id));
            plan_merge(
                &MergeContext {
                    provider_id: &result.provider_id,
                    existing,
                    fingerprint: &result.fingerprint,
                    stale: result.stale,
                    cooldown: result.cooldown,
                    now: Utc::now(),
                },
                &decision,
            )
        };

        match plan.outcome {
            MergeOutcome::Accepted => counters.accepted += 1,
            MergeOutcome::Unchanged => counters.unchanged += 1,
            MergeOutcome::Rejected => counters.rejected += 1,
            MergeOutcome::Ambiguous => counters.ambiguous += 1,
            MergeOutcome::SkippedManual => counters.skipped_manual += 1,
        }
        if let MatchDecision::Ambiguous { candidates } = &decision {
            self.review.push(ReviewItem {
                venue_id: result.venue_id.clone(),
                provider_id: result.provider_id.clone(),
                candidates: candidates.iter().map(ReviewCandidate::from).collect(),
            });
        }

        if let Some(update) = plan.update {
            match self.store.apply(&result.venue_id, update) {
                ApplyOutcome::Applied => self.pending_saves += 1,
                ApplyOutcome::Unchanged => {}
                ApplyOutcome::SkippedManual => {}
                ApplyOutcome::UnknownRecord => {
                    warn!(venue_id = %result.venue_id, "merge targeted a record missing from the store");
                }
            }
        }

        if self.pending_saves >= self.save_every {
            self.save().await?;
        }
        Ok(())
    }

    async fn save(&mut self) -> Result<(), StoreError> {
        if self.dry_run {
            self.pending_saves = 0;
            return Ok(());
        }
        let receipt = self.store.save().await?;
        self.saves += 1;
        self.pending_saves = 0;
        debug!(saves = self.saves, sha256 = %receipt.content_hash, "merge writer flushed store");
        Ok(())
    }
}
