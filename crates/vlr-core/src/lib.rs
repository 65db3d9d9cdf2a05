//! Core domain model and provenance types for the venue link reconciler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "vlr-core";

pub type VenueId = String;
pub type ProviderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Structured address parts. Every part is optional; curated data is uneven.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressComponents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl AddressComponents {
    pub fn is_empty(&self) -> bool {
        self.street.is_none()
            && self.locality.is_none()
            && self.region.is_none()
            && self.postal_code.is_none()
            && self.country.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    #[default]
    Unresolved,
    Ambiguous,
    Stale,
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Unresolved => write!(f, "unresolved"),
            Self::Ambiguous => write!(f, "ambiguous"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Origin of a reference value. Manual values are never replaced automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Manual,
    #[default]
    Auto,
}

/// Why the last lookup for a field did not produce a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    NotFound,
    BelowThreshold,
    Ambiguous,
}

/// One provider reference on a venue, with status and provenance bookkeeping.
///
/// Hand-edited files may omit `status` and `provenance`. A field carrying a
/// value without an explicit provenance is treated as manual, and one without
/// an explicit status as resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ReferenceFieldRepr")]
pub struct ReferenceField {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_id: Option<String>,
    pub status: ResolutionStatus,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<AttemptOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_fingerprint: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

#[derive(Deserialize)]
struct ReferenceFieldRepr {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    native_id: Option<String>,
    #[serde(default)]
    status: Option<ResolutionStatus>,
    #[serde(default)]
    provenance: Option<Provenance>,
    #[serde(default)]
    resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_attempted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_outcome: Option<AttemptOutcome>,
    #[serde(default)]
    candidate_count: Option<usize>,
    #[serde(default)]
    identity_fingerprint: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, JsonValue>,
}

impl From<ReferenceFieldRepr> for ReferenceField {
    fn from(repr: ReferenceFieldRepr) -> Self {
        let has_value = repr.value.as_deref().is_some_and(|v| !v.trim().is_empty());
        let status = repr.status.unwrap_or(if has_value {
            ResolutionStatus::Resolved
        } else {
            ResolutionStatus::Unresolved
        });
        let provenance = repr.provenance.unwrap_or(if has_value {
            Provenance::Manual
        } else {
            Provenance::Auto
        });
        Self {
            value: repr.value,
            native_id: repr.native_id,
            status,
            provenance,
            resolved_at: repr.resolved_at,
            last_attempted_at: repr.last_attempted_at,
            last_outcome: repr.last_outcome,
            candidate_count: repr.candidate_count,
            identity_fingerprint: repr.identity_fingerprint,
            extra: repr.extra,
        }
    }
}

impl ReferenceField {
    pub fn unresolved() -> Self {
        Self {
            value: None,
            native_id: None,
            status: ResolutionStatus::Unresolved,
            provenance: Provenance::Auto,
            resolved_at: None,
            last_attempted_at: None,
            last_outcome: None,
            candidate_count: None,
            identity_fingerprint: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn manual(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            status: ResolutionStatus::Resolved,
            provenance: Provenance::Manual,
            ..Self::unresolved()
        }
    }

    pub fn auto_resolved(
        value: impl Into<String>,
        native_id: impl Into<String>,
        resolved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            value: Some(value.into()),
            native_id: Some(native_id.into()),
            status: ResolutionStatus::Resolved,
            provenance: Provenance::Auto,
            resolved_at: Some(resolved_at),
            ..Self::unresolved()
        }
    }

    pub fn is_manual(&self) -> bool {
        self.provenance == Provenance::Manual
    }
}

/// Canonical venue entry. Unknown keys are kept in `extra` so curated columns
/// survive a load/save cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "AddressComponents::is_empty")]
    pub address_components: AddressComponents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub refs: BTreeMap<ProviderId, ReferenceField>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl VenueRecord {
    pub fn new(name: impl Into<String>, address: Option<String>) -> Self {
        Self {
            name: name.into(),
            address,
            address_components: AddressComponents::default(),
            coordinates: None,
            refs: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn reference(&self, provider_id: &str) -> Option<&ReferenceField> {
        self.refs.get(provider_id)
    }

    pub fn lookup_query(&self, venue_id: &str) -> LookupQuery {
        LookupQuery {
            venue_id: venue_id.to_string(),
            name: self.name.clone(),
            address: self.address.clone(),
            components: self.address_components.clone(),
            coordinates: self.coordinates,
        }
    }
}

/// Structured query handed to a provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupQuery {
    pub venue_id: VenueId,
    pub name: String,
    pub address: Option<String>,
    #[serde(default)]
    pub components: AddressComponents,
    pub coordinates: Option<Coordinates>,
}

impl LookupQuery {
    /// Single-line free text search string ("name, address, locality").
    pub fn search_text(&self) -> String {
        let mut parts = vec![self.name.trim().to_string()];
        if let Some(address) = self.address.as_deref().filter(|a| !a.trim().is_empty()) {
            parts.push(address.trim().to_string());
        }
        if let Some(locality) = self.components.locality.as_deref() {
            if !parts.iter().any(|p| p.contains(locality)) {
                parts.push(locality.to_string());
            }
        }
        parts.join(", ")
    }
}

/// A single provider result for one query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateMatch {
    pub provider_id: ProviderId,
    pub native_id: String,
    pub name: String,
    pub address: Option<String>,
    pub address_parts: AddressComponents,
    pub coordinates: Option<Coordinates>,
    pub rank: Option<u32>,
    pub confidence: Option<f64>,
    pub link: Option<String>,
    #[serde(skip)]
    pub raw: JsonValue,
}

impl CandidateMatch {
    pub fn new(provider_id: impl Into<String>, native_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            native_id: native_id.into(),
            name: name.into(),
            address: None,
            address_parts: AddressComponents::default(),
            coordinates: None,
            rank: None,
            confidence: None,
            link: None,
            raw: JsonValue::Null,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_coordinates(mut self, lat: f64, lng: f64) -> Self {
        self.coordinates = Some(Coordinates { lat, lng });
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

/// A candidate with the scores the matcher assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub candidate: CandidateMatch,
    pub score: f64,
    pub name_score: f64,
    pub address_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    NoCandidates,
    NameBelowFloor { best_name_score: f64 },
    BelowThreshold { best_score: f64 },
}

impl RejectReason {
    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self {
            Self::NoCandidates => AttemptOutcome::NotFound,
            Self::NameBelowFloor { .. } | Self::BelowThreshold { .. } => {
                AttemptOutcome::BelowThreshold
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MatchDecision {
    Accept { candidate: ScoredCandidate },
    Reject { reason: RejectReason },
    Ambiguous { candidates: Vec<ScoredCandidate> },
}

/// A single reference-field mutation routed through the record store.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub provider_id: ProviderId,
    pub field: ReferenceField,
}
