//! Candidate scoring and match decisions.
//!
//! The matcher is pure: the same query and candidate list always produce the
//! same [`MatchDecision`]. Ties are broken by provider order.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};
use vlr_core::{CandidateMatch, Coordinates, LookupQuery, MatchDecision, RejectReason, ScoredCandidate};

/// Policy knobs for accepting a candidate.
///
/// * `accept_threshold` - minimum combined score for an automatic accept.
/// * `margin` - the top candidate must beat every other candidate by at least
///   this much, otherwise the decision is `Ambiguous`.
/// * `min_name_similarity` - candidates whose name scores below this floor are
///   discarded no matter how well the address matches.
/// * `unknown_address_score` - address score used when either side has no
///   address to compare.
/// * `near_meters` / `far_meters` - distance band for coordinate scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub accept_threshold: f64,
    pub margin: f64,
    pub min_name_similarity: f64,
    pub name_weight: f64,
    pub address_weight: f64,
    pub unknown_address_score: f64,
    pub near_meters: f64,
    pub far_meters: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.75,
            margin: 0.08,
            min_name_similarity: 0.55,
            name_weight: 0.6,
            address_weight: 0.4,
            unknown_address_score: 0.5,
            near_meters: 75.0,
            far_meters: 1500.0,
        }
    }
}

const STREET_ABBREVIATIONS: &[(&str, &str)] = &[
    ("street", "st"),
    ("avenue", "ave"),
    ("av", "ave"),
    ("road", "rd"),
    ("boulevard", "blvd"),
    ("drive", "dr"),
    ("lane", "ln"),
    ("place", "pl"),
    ("court", "ct"),
    ("square", "sq"),
    ("highway", "hwy"),
    ("parkway", "pkwy"),
    ("terrace", "ter"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
    ("suite", "ste"),
];

/// Lowercase, strip diacritics and apostrophes, turn other punctuation into
/// spaces and collapse whitespace.
pub fn normalize_text(input: &str) -> String {
    let folded: String = input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(|c| c.to_lowercase())
        .filter(|c| !matches!(c, '\'' | '\u{2019}' | '\u{2018}' | '`'))
        .map(|c| if c == '&' { ' ' } else { c })
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_address_line(input: &str) -> String {
    normalize_text(input)
        .split_whitespace()
        .map(|token| {
            STREET_ABBREVIATIONS
                .iter()
                .find(|(long, _)| *long == token)
                .map(|(_, short)| *short)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn token_dice(a: &str, b: &str) -> f64 {
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    (2.0 * shared as f64) / (ta.len() + tb.len()) as f64
}

pub fn name_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_text(a);
    let nb = normalize_text(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }
    (0.6 * jaro_winkler(&na, &nb)) + (0.4 * token_dice(&na, &nb))
}

pub fn haversine_meters(a: Coordinates, b: Coordinates) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

fn first_line(address: &str) -> &str {
    address.split(',').next().unwrap_or(address).trim()
}

fn house_number(normalized_line: &str) -> Option<&str> {
    normalized_line
        .split_whitespace()
        .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
}

fn street_words(normalized_line: &str) -> String {
    normalized_line
        .split_whitespace()
        .filter(|t| !t.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn line_similarity(query_line: &str, candidate_line: &str) -> f64 {
    let q = normalize_address_line(query_line);
    let c = normalize_address_line(candidate_line);
    if q == c {
        return 1.0;
    }
    let number_score = match (house_number(&q), house_number(&c)) {
        (Some(a), Some(b)) if a == b => 1.0,
        (Some(_), Some(_)) => 0.0,
        _ => 0.5,
    };
    let (qs, cs) = (street_words(&q), street_words(&c));
    let street_score = if qs.is_empty() || cs.is_empty() {
        0.5
    } else {
        token_dice(&qs, &cs)
    };
    0.5 * number_score + 0.5 * street_score
}

/// Compare one locality-ish component, falling back to a token search in the
/// candidate's full address when the provider gave no structured part.
fn component_agreement(query_part: Option<&str>, candidate_part: Option<&str>, candidate_full: &str) -> Option<f64> {
    let q = normalize_text(query_part?);
    if q.is_empty() {
        return None;
    }
    if let Some(c) = candidate_part {
        return Some(if normalize_text(c) == q { 1.0 } else { 0.0 });
    }
    if candidate_full.is_empty() {
        return None;
    }
    let padded = format!(" {candidate_full} ");
    Some(if padded.contains(&format!(" {q} ")) { 1.0 } else { 0.0 })
}

/// Deterministic scorer and decision rule over one provider's candidate set.
#[derive(Debug, Clone)]
pub struct Matcher {
    config: MatcherConfig,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}

impl Matcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// `None` when either side lacks anything to compare.
    pub fn address_similarity(&self, query: &LookupQuery, candidate: &CandidateMatch) -> Option<f64> {
        if let (Some(a), Some(b)) = (query.coordinates, candidate.coordinates) {
            let distance = haversine_meters(a, b);
            let (near, far) = (self.config.near_meters, self.config.far_meters.max(self.config.near_meters));
            let score = if distance <= near {
                1.0
            } else if distance >= far {
                0.0
            } else {
                1.0 - (distance - near) / (far - near)
            };
            return Some(score);
        }

        let query_line = query
            .components
            .street
            .as_deref()
            .or(query.address.as_deref().map(first_line))
            .filter(|l| !l.is_empty())?;
        let candidate_line = candidate
            .address_parts
            .street
            .as_deref()
            .or(candidate.address.as_deref().map(first_line))
            .filter(|l| !l.is_empty())?;

        let line = line_similarity(query_line, candidate_line);
        let candidate_full = candidate.address.as_deref().map(normalize_text).unwrap_or_default();
        let locality: Vec<f64> = [
            component_agreement(
                query.components.postal_code.as_deref(),
                candidate.address_parts.postal_code.as_deref(),
                &candidate_full,
            ),
            component_agreement(
                query.components.locality.as_deref(),
                candidate.address_parts.locality.as_deref(),
                &candidate_full,
            ),
        ]
        .into_iter()
        .flatten()
        .collect();

        if locality.is_empty() {
            Some(line)
        } else {
            let locality_score = locality.iter().sum::<f64>() / locality.len() as f64;
            Some(0.75 * line + 0.25 * locality_score)
        }
    }

    pub fn score(&self, query: &LookupQuery, candidate: &CandidateMatch) -> ScoredCandidate {
        let name_score = name_similarity(&query.name, &candidate.name);
        let address_score = self
            .address_similarity(query, candidate)
            .unwrap_or(self.config.unknown_address_score);
        let score = self.config.name_weight * name_score + self.config.address_weight * address_score;
        ScoredCandidate {
            candidate: candidate.clone(),
            score,
            name_score,
            address_score,
        }
    }

    pub fn decide(&self, query: &LookupQuery, candidates: &[CandidateMatch]) -> MatchDecision {
        if candidates.is_empty() {
            return MatchDecision::Reject {
                reason: RejectReason::NoCandidates,
            };
        }

        let scored: Vec<(usize, ScoredCandidate)> = candidates
            .iter()
            .map(|c| self.score(query, c))
            .enumerate()
            .collect();
        let best_name_score = scored
            .iter()
            .map(|(_, s)| s.name_score)
            .fold(0.0_f64, f64::max);

        let mut eligible: Vec<(usize, ScoredCandidate)> = scored
            .into_iter()
            .filter(|(_, s)| s.name_score >= self.config.min_name_similarity)
            .collect();
        if eligible.is_empty() {
            return MatchDecision::Reject {
                reason: RejectReason::NameBelowFloor { best_name_score },
            };
        }

        eligible.sort_by(|(ia, a), (ib, b)| b.score.total_cmp(&a.score).then(ia.cmp(ib)));
        let top = eligible[0].1.score;
        if top < self.config.accept_threshold {
            return MatchDecision::Reject {
                reason: RejectReason::BelowThreshold { best_score: top },
            };
        }

        let margin = self.config.margin;
        let contenders: Vec<ScoredCandidate> = eligible
            .into_iter()
            .take_while(|(_, s)| top - s.score < margin || top - s.score <= f64::EPSILON)
            .map(|(_, s)| s)
            .collect();

        if contenders.len() > 1 {
            return MatchDecision::Ambiguous {
                candidates: contenders,
            };
        }

        match contenders.into_iter().next() {
            Some(candidate) => MatchDecision::Accept { candidate },
            None => MatchDecision::Reject {
                reason: RejectReason::BelowThreshold { best_score: top },
            },
        }
    }
}
