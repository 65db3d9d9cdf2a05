//! Turns a match decision into the field update the writer applies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vlr_core::{
    AttemptOutcome, FieldUpdate, LookupQuery, MatchDecision, Provenance, ReferenceField,
    ResolutionStatus,
};

use crate::matcher::{normalize_address_line, normalize_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Accepted,
    Unchanged,
    Rejected,
    Ambiguous,
    SkippedManual,
}

#[derive(Debug, Clone)]
pub struct MergeContext<'a> {
    pub provider_id: &'a str,
    pub existing: Option<&'a ReferenceField>,
    /// Fingerprint of the record's identity at query time.
    pub fingerprint: &'a str,
    /// The existing resolved value was judged stale before querying.
    pub stale: bool,
    /// Provider cool-down; a repeated failure only refreshes the attempt
    /// time once the previous attempt has left this window.
    pub cooldown: Option<chrono::Duration>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub outcome: MergeOutcome,
    pub update: Option<FieldUpdate>,
}

impl MergePlan {
    fn without_update(outcome: MergeOutcome) -> Self {
        Self {
            outcome,
            update: None,
        }
    }
}

/// Hash of the identifying parts of a record. A change means an earlier
/// automatic resolution may point at the wrong place.
pub fn identity_fingerprint(query: &LookupQuery) -> String {
    let name = normalize_text(&query.name);
    let address = query
        .address
        .as_deref()
        .map(normalize_address_line)
        .unwrap_or_default();
    let postal = query
        .components
        .postal_code
        .as_deref()
        .map(normalize_text)
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(address.as_bytes());
    hasher.update([0x1f]);
    hasher.update(postal.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn plan_merge(ctx: &MergeContext<'_>, decision: &MatchDecision) -> MergePlan {
    if ctx.existing.is_some_and(ReferenceField::is_manual) {
        return MergePlan::without_update(MergeOutcome::SkippedManual);
    }
    let base = ctx
        .existing
        .cloned()
        .unwrap_or_else(ReferenceField::unresolved);

    match decision {
        MatchDecision::Accept { candidate } => {
            let value = candidate
                .candidate
                .link
                .clone()
                .unwrap_or_else(|| candidate.candidate.native_id.clone());
            let unchanged = base.status == ResolutionStatus::Resolved
                && base.value.as_deref() == Some(value.as_str())
                && base.identity_fingerprint.as_deref() == Some(ctx.fingerprint)
                && !ctx.stale;
            if unchanged {
                return MergePlan::without_update(MergeOutcome::Unchanged);
            }
            let field = ReferenceField {
                value: Some(value),
                native_id: Some(candidate.candidate.native_id.clone()),
                status: ResolutionStatus::Resolved,
                provenance: Provenance::Auto,
                resolved_at: Some(ctx.now),
                last_attempted_at: Some(ctx.now),
                last_outcome: None,
                candidate_count: None,
                identity_fingerprint: Some(ctx.fingerprint.to_string()),
                extra: base.extra,
            };
            plan(MergeOutcome::Accepted, ctx.provider_id, field)
        }
        MatchDecision::Reject { reason } => {
            if base.status == ResolutionStatus::Resolved && !ctx.stale {
                return MergePlan::without_update(MergeOutcome::Rejected);
            }
            let has_value = base.value.is_some();
            let field = ReferenceField {
                status: if has_value {
                    ResolutionStatus::Stale
                } else {
                    ResolutionStatus::Unresolved
                },
                last_attempted_at: Some(ctx.now),
                last_outcome: Some(reason.attempt_outcome()),
                candidate_count: None,
                identity_fingerprint: Some(ctx.fingerprint.to_string()),
                ..base.clone()
            };
            if repeats_attempt(ctx, &base, &field) {
                return MergePlan::without_update(MergeOutcome::Rejected);
            }
            plan(MergeOutcome::Rejected, ctx.provider_id, field)
        }
        MatchDecision::Ambiguous { candidates } => {
            let field = ReferenceField {
                status: ResolutionStatus::Ambiguous,
                last_attempted_at: Some(ctx.now),
                last_outcome: Some(AttemptOutcome::Ambiguous),
                candidate_count: Some(candidates.len()),
                identity_fingerprint: Some(ctx.fingerprint.to_string()),
                ..base.clone()
            };
            if repeats_attempt(ctx, &base, &field) {
                return MergePlan::without_update(MergeOutcome::Ambiguous);
            }
            plan(MergeOutcome::Ambiguous, ctx.provider_id, field)
        }
    }
}

/// True when a failed attempt would only move `last_attempted_at`. Without a
/// cool-down the timestamp never matters, so the field is left as it was.
fn repeats_attempt(ctx: &MergeContext<'_>, before: &ReferenceField, after: &ReferenceField) -> bool {
    let same = before.status == after.status
        && before.value == after.value
        && before.last_outcome == after.last_outcome
        && before.candidate_count == after.candidate_count
        && before.identity_fingerprint == after.identity_fingerprint;
    same && match (ctx.cooldown, before.last_attempted_at) {
        (None, _) => true,
        (Some(cooldown), Some(attempted)) => ctx.now - attempted < cooldown,
        (Some(_), None) => false,
    }
}

fn plan(outcome: MergeOutcome, provider_id: &str, field: ReferenceField) -> MergePlan {
    MergePlan {
        outcome,
        update: Some(FieldUpdate {
            provider_id: provider_id.to_string(),
            field,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vlr_core::{CandidateMatch, RejectReason, ScoredCandidate, VenueRecord};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn accept(link: &str) -> MatchDecision {
        MatchDecision::Accept {
            candidate: ScoredCandidate {
                candidate: CandidateMatch::new("google_maps", "ChIJjoes", "Joe's Pizza")
                    .with_link(link),
                score: 1.0,
                name_score: 1.0,
                address_score: 1.0,
            },
        }
    }

    fn ctx<'a>(existing: Option<&'a ReferenceField>, stale: bool) -> MergeContext<'a> {
        MergeContext {
            provider_id: "google_maps",
            existing,
            fingerprint: "fp-1",
            stale,
            cooldown: None,
            now: now(),
        }
    }

    #[test]
    fn accept_writes_auto_resolved_field() {
        let plan = plan_merge(&ctx(None, false), &accept("https://maps.example/joes"));
        assert_eq!(plan.outcome, MergeOutcome::Accepted);
        let update = plan.update.unwrap();
        assert_eq!(update.provider_id, "google_maps");
        assert_eq!(update.field.value.as_deref(), Some("https://maps.example/joes"));
        assert_eq!(update.field.native_id.as_deref(), Some("ChIJjoes"));
        assert_eq!(update.field.status, ResolutionStatus::Resolved);
        assert_eq!(update.field.provenance, Provenance::Auto);
        assert_eq!(update.field.resolved_at, Some(now()));
        assert_eq!(update.field.identity_fingerprint.as_deref(), Some("fp-1"));
    }

    #[test]
    fn manual_field_is_never_planned_over() {
        let manual = ReferenceField::manual("https://maps.example/curated");
        for decision in [
            accept("https://maps.example/other"),
            MatchDecision::Reject {
                reason: RejectReason::NoCandidates,
            },
            MatchDecision::Ambiguous { candidates: vec![] },
        ] {
            let plan = plan_merge(&ctx(Some(&manual), false), &decision);
            assert_eq!(plan.outcome, MergeOutcome::SkippedManual);
            assert!(plan.update.is_none());
        }
    }

    #[test]
    fn same_accept_twice_is_unchanged() {
        let mut existing = ReferenceField::auto_resolved("https://maps.example/joes", "ChIJjoes", now());
        existing.identity_fingerprint = Some("fp-1".into());
        let plan = plan_merge(&ctx(Some(&existing), false), &accept("https://maps.example/joes"));
        assert_eq!(plan, MergePlan::without_update(MergeOutcome::Unchanged));
    }

    #[test]
    fn reject_keeps_fresh_resolution_but_marks_stale_one() {
        let mut existing = ReferenceField::auto_resolved("https://maps.example/joes", "ChIJjoes", now());
        existing.identity_fingerprint = Some("fp-0".into());
        let reject = MatchDecision::Reject {
            reason: RejectReason::BelowThreshold { best_score: 0.4 },
        };

        let plan = plan_merge(&ctx(Some(&existing), false), &reject);
        assert!(plan.update.is_none());

        let plan = plan_merge(&ctx(Some(&existing), true), &reject);
        let field = plan.update.unwrap().field;
        assert_eq!(field.status, ResolutionStatus::Stale);
        assert_eq!(field.value.as_deref(), Some("https://maps.example/joes"));
        assert_eq!(field.last_outcome, Some(AttemptOutcome::BelowThreshold));
    }

    #[test]
    fn reject_on_empty_field_records_attempt() {
        let plan = plan_merge(
            &ctx(None, false),
            &MatchDecision::Reject {
                reason: RejectReason::NoCandidates,
            },
        );
        assert_eq!(plan.outcome, MergeOutcome::Rejected);
        let field = plan.update.unwrap().field;
        assert_eq!(field.status, ResolutionStatus::Unresolved);
        assert_eq!(field.value, None);
        assert_eq!(field.last_attempted_at, Some(now()));
        assert_eq!(field.last_outcome, Some(AttemptOutcome::NotFound));
    }

    #[test]
    fn ambiguous_keeps_value_and_counts_candidates() {
        let existing = ReferenceField {
            status: ResolutionStatus::Stale,
            ..ReferenceField::auto_resolved("https://maps.example/old", "old", now())
        };
        let scored = match accept("x") {
            MatchDecision::Accept { candidate } => candidate,
            _ => unreachable!(),
        };
        let plan = plan_merge(
            &ctx(Some(&existing), true),
            &MatchDecision::Ambiguous {
                candidates: vec![scored.clone(), scored],
            },
        );
        let field = plan.update.unwrap().field;
        assert_eq!(field.status, ResolutionStatus::Ambiguous);
        assert_eq!(field.value.as_deref(), Some("https://maps.example/old"));
        assert_eq!(field.candidate_count, Some(2));
    }

    #[test]
    fn repeated_failure_leaves_field_alone() {
        let reject = MatchDecision::Reject {
            reason: RejectReason::NoCandidates,
        };
        let first = plan_merge(&ctx(None, false), &reject).update.unwrap().field;

        let mut later = ctx(Some(&first), false);
        later.now = now() + chrono::Duration::minutes(5);
        let plan = plan_merge(&later, &reject);
        assert_eq!(plan, MergePlan::without_update(MergeOutcome::Rejected));

        let scored = match accept("x") {
            MatchDecision::Accept { candidate } => candidate,
            _ => unreachable!(),
        };
        let ambiguous = MatchDecision::Ambiguous {
            candidates: vec![scored.clone(), scored],
        };
        let first = plan_merge(&ctx(None, false), &ambiguous).update.unwrap().field;
        let mut later = ctx(Some(&first), false);
        later.now = now() + chrono::Duration::minutes(5);
        assert_eq!(
            plan_merge(&later, &ambiguous),
            MergePlan::without_update(MergeOutcome::Ambiguous)
        );
    }

    #[test]
    fn repeated_failure_restarts_an_expired_cooldown() {
        let reject = MatchDecision::Reject {
            reason: RejectReason::NoCandidates,
        };
        let first = plan_merge(&ctx(None, false), &reject).update.unwrap().field;

        let mut within = ctx(Some(&first), false);
        within.cooldown = Some(chrono::Duration::hours(24));
        within.now = now() + chrono::Duration::hours(1);
        assert!(plan_merge(&within, &reject).update.is_none());

        let mut after = within.clone();
        after.now = now() + chrono::Duration::hours(30);
        let field = plan_merge(&after, &reject).update.unwrap().field;
        assert_eq!(field.last_attempted_at, Some(after.now));
        assert_eq!(field.status, ResolutionStatus::Unresolved);
    }

    #[test]
    fn fingerprint_tracks_identity_not_formatting() {
        let a = VenueRecord::new("Joe's Pizza", Some("12 Main Street".into())).lookup_query("v1");
        let b = VenueRecord::new("JOES  pizza", Some("12 main st".into())).lookup_query("v1");
        let c = VenueRecord::new("Joe's Pizza", Some("14 Main Street".into())).lookup_query("v1");
        assert_eq!(identity_fingerprint(&a), identity_fingerprint(&b));
        assert_ne!(identity_fingerprint(&a), identity_fingerprint(&c));
    }
}
