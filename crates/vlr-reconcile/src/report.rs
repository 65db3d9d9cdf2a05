//! Run summaries and the per-run report directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;
use vlr_core::{ProviderId, ScoredCandidate, VenueId};

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCounters {
    pub accepted: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub ambiguous: usize,
    pub errored: usize,
    pub skipped_manual: usize,
    pub skipped_fresh: usize,
    pub skipped_cooldown: usize,
    pub skipped_disabled: usize,
    pub cancelled: usize,
    pub throttled: usize,
    pub retries: usize,
    pub conflicts: usize,
}

impl ProviderCounters {
    pub fn absorb(&mut self, other: &ProviderCounters) {
        self.accepted += other.accepted;
        self.unchanged += other.unchanged;
        self.rejected += other.rejected;
        self.ambiguous += other.ambiguous;
        self.errored += other.errored;
        self.skipped_manual += other.skipped_manual;
        self.skipped_fresh += other.skipped_fresh;
        self.skipped_cooldown += other.skipped_cooldown;
        self.skipped_disabled += other.skipped_disabled;
        self.cancelled += other.cancelled;
        self.throttled += other.throttled;
        self.retries += other.retries;
        self.conflicts += other.conflicts;
    }

    /// Pairs that needed no change.
    pub fn no_change(&self) -> usize {
        self.unchanged + self.skipped_fresh
    }

    /// Pairs that were attempted and did not resolve.
    pub fn failed(&self) -> usize {
        self.rejected + self.errored
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCandidate {
    pub native_id: String,
    pub name: String,
    pub address: Option<String>,
    pub link: Option<String>,
    pub score: f64,
}

impl From<&ScoredCandidate> for ReviewCandidate {
    fn from(scored: &ScoredCandidate) -> Self {
        Self {
            native_id: scored.candidate.native_id.clone(),
            name: scored.candidate.name.clone(),
            address: scored.candidate.address.clone(),
            link: scored.candidate.link.clone(),
            score: scored.score,
        }
    }
}

/// An ambiguous pair left for an operator to settle by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub venue_id: VenueId,
    pub provider_id: ProviderId,
    pub candidates: Vec<ReviewCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErroredItem {
    pub venue_id: VenueId,
    pub provider_id: ProviderId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_path: String,
    pub records: usize,
    pub dry_run: bool,
    pub cancelled: bool,
    pub saves: usize,
    pub providers: BTreeMap<ProviderId, ProviderCounters>,
    #[serde(default)]
    pub disabled_providers: Vec<ProviderId>,
    #[serde(default)]
    pub review: Vec<ReviewItem>,
    #[serde(default)]
    pub errored: Vec<ErroredItem>,
}

impl RunSummary {
    pub fn totals(&self) -> ProviderCounters {
        let mut totals = ProviderCounters::default();
        for counters in self.providers.values() {
            totals.absorb(counters);
        }
        totals
    }

    pub fn counters(&self, provider_id: &str) -> ProviderCounters {
        self.providers.get(provider_id).copied().unwrap_or_default()
    }

    pub fn brief_markdown(&self) -> String {
        let totals = self.totals();
        let mut lines = vec![
            "# Venue Link Reconciliation Brief".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Store: `{}` ({} records)", self.store_path, self.records),
            format!("- Saves: {}{}", self.saves, if self.dry_run { " (dry run)" } else { "" }),
        ];
        if self.cancelled {
            lines.push("- Run was cancelled before completion".to_string());
        }
        lines.push(format!(
            "- Accepted: {} | No change: {} | Failed: {} | Ambiguous: {} | Manual: {}",
            totals.accepted,
            totals.no_change(),
            totals.failed(),
            totals.ambiguous,
            totals.skipped_manual
        ));
        lines.push(String::new());

        lines.push("## Providers".to_string());
        lines.push(String::new());
        lines.push(
            "| provider | accepted | unchanged | rejected | ambiguous | errored | manual | fresh | cool-down | disabled | cancelled | throttled | retries |"
                .to_string(),
        );
        lines.push("|---|---|---|---|---|---|---|---|---|---|---|---|---|".to_string());
        for (provider_id, c) in &self.providers {
            lines.push(format!(
                "| {provider_id} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |",
                c.accepted,
                c.unchanged,
                c.rejected,
                c.ambiguous,
                c.errored,
                c.skipped_manual,
                c.skipped_fresh,
                c.skipped_cooldown,
                c.skipped_disabled,
                c.cancelled,
                c.throttled,
                c.retries
            ));
        }
        if !self.disabled_providers.is_empty() {
            lines.push(String::new());
            lines.push(format!(
                "Disabled during run: {}",
                self.disabled_providers.join(", ")
            ));
        }

        if !self.review.is_empty() {
            lines.push(String::new());
            lines.push("## Needs Review".to_string());
            for item in &self.review {
                lines.push(format!("- `{}` / {}", item.venue_id, item.provider_id));
                for candidate in &item.candidates {
                    lines.push(format!(
                        "  - {:.3} {} ({}){}",
                        candidate.score,
                        candidate.name,
                        candidate.address.as_deref().unwrap_or("no address"),
                        candidate
                            .link
                            .as_deref()
                            .map(|l| format!(" <{l}>"))
                            .unwrap_or_default()
                    ));
                }
            }
        }

        if !self.errored.is_empty() {
            lines.push(String::new());
            lines.push("## Errors".to_string());
            for item in &self.errored {
                lines.push(format!("- `{}` / {}: {}", item.venue_id, item.provider_id, item.error));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Write `reports/<run_id>/run_summary.json` and `run_brief.md` under `root`.
pub async fn write_reports(root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = root.join("reports").join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(reports_dir.join(BRIEF_FILE), summary.brief_markdown())
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    Ok(reports_dir)
}

/// Markdown listing of the most recent `runs` run summaries, newest first.
pub fn report_runs_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut summaries = Vec::new();
    let entries = match std::fs::read_dir(&reports_root) {
        Ok(entries) => entries,
        // nothing has run here yet
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(runs_markdown(Vec::new(), runs));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_root.display()));
        }
    };
    for entry in entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let summary_path = entry.path().join(SUMMARY_FILE);
        if !summary_path.exists() {
            continue;
        }
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        summaries.push((entry.path(), summary));
    }
    summaries.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));
    Ok(runs_markdown(summaries, runs))
}

fn runs_markdown(summaries: Vec<(PathBuf, RunSummary)>, runs: usize) -> String {
    let mut lines = vec!["# Venue Link Reconciliation Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (dir, summary) in summaries.into_iter().take(runs.max(1)) {
        let totals = summary.totals();
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- accepted: {}, no change: {}, failed: {}, ambiguous: {}, manual: {}",
            totals.accepted,
            totals.no_change(),
            totals.failed(),
            totals.ambiguous,
            totals.skipped_manual
        ));
        if summary.cancelled {
            lines.push("- cancelled".to_string());
        }
        if !summary.disabled_providers.is_empty() {
            lines.push(format!("- disabled: {}", summary.disabled_providers.join(", ")));
        }
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}
