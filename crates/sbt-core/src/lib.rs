//! Core domain model and badge classification for SBT.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sbt-core";

/// Badge titles containing this marker count as arcade-game completions.
pub const ARCADE_MARKER: &str = "Arcade";

pub const UNKNOWN_NAME: &str = "Unknown";
pub const UNKNOWN_BADGE: &str = "Unknown Badge";

pub const SHEET_HEADER: [&str; 5] = [
    "Name",
    "No. of Skill Badges Completed",
    "No. of Arcade Games Completed",
    "Progress %",
    "Completion Status",
];

/// One learner's progress as scraped from a public profile page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub name: String,
    pub skill_badges: u32,
    pub arcade_game: u32,
    pub progress: String,
    pub percent: f64,
}

impl ProfileRecord {
    pub fn from_classification(name: impl Into<String>, classification: Classification) -> Self {
        Self {
            name: name.into(),
            skill_badges: classification.skill_badges,
            arcade_game: classification.arcade_games,
            progress: classification.progress,
            percent: classification.percent,
        }
    }

    /// Cells written for this record, in sheet column order.
    pub fn to_row(&self) -> Vec<CellValue> {
        vec![
            CellValue::Text(self.name.clone()),
            CellValue::Integer(i64::from(self.skill_badges)),
            CellValue::Integer(i64::from(self.arcade_game)),
            CellValue::Text(self.progress.clone()),
            CellValue::Number(self.percent),
        ]
    }
}

/// A single spreadsheet cell as sent to the sheet service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Integer(v) => write!(f, "{v}"),
            CellValue::Number(v) => write!(f, "{v}"),
            CellValue::Text(v) => f.write_str(v),
        }
    }
}

pub fn header_row() -> Vec<CellValue> {
    SHEET_HEADER
        .iter()
        .map(|h| CellValue::Text((*h).to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressTarget {
    pub skill_badges: u32,
    pub arcade_games: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressTier {
    pub label: String,
    #[serde(default)]
    pub min_skill_badges: u32,
    #[serde(default)]
    pub min_arcade_games: u32,
}

impl ProgressTier {
    fn reached(&self, skill_badges: u32, arcade_games: u32) -> bool {
        skill_badges >= self.min_skill_badges && arcade_games >= self.min_arcade_games
    }
}

/// Milestone policy applied to badge counts.
///
/// Tiers are listed in ascending order; the last tier whose minimums are met
/// names the learner's progress. Cut-offs are supplied by the operator through
/// a rules file, nothing is built in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressTable {
    pub baseline_label: String,
    #[serde(default)]
    pub target: Option<ProgressTarget>,
    #[serde(default)]
    pub tiers: Vec<ProgressTier>,
}

impl Default for ProgressTable {
    fn default() -> Self {
        Self {
            baseline_label: "No progress".to_string(),
            target: None,
            tiers: Vec::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressTableError {
    #[error("baseline label must not be empty")]
    EmptyBaselineLabel,
    #[error("tier #{index} has an empty label")]
    EmptyTierLabel { index: usize },
    #[error("tier {label:?} has no minimums; an empty badge list would reach it")]
    TierWithoutMinimum { label: String },
}

impl ProgressTable {
    pub fn validate(&self) -> Result<(), ProgressTableError> {
        if self.baseline_label.trim().is_empty() {
            return Err(ProgressTableError::EmptyBaselineLabel);
        }
        for (index, tier) in self.tiers.iter().enumerate() {
            if tier.label.trim().is_empty() {
                return Err(ProgressTableError::EmptyTierLabel { index });
            }
            if tier.min_skill_badges == 0 && tier.min_arcade_games == 0 {
                return Err(ProgressTableError::TierWithoutMinimum {
                    label: tier.label.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn label_for(&self, skill_badges: u32, arcade_games: u32) -> &str {
        self.tiers
            .iter()
            .rev()
            .find(|tier| tier.reached(skill_badges, arcade_games))
            .map(|tier| tier.label.as_str())
            .unwrap_or(self.baseline_label.as_str())
    }

    pub fn percent_for(&self, skill_badges: u32, arcade_games: u32) -> f64 {
        let Some(target) = self.target else {
            return 0.0;
        };
        let total = u64::from(target.skill_badges) + u64::from(target.arcade_games);
        if total == 0 {
            return 0.0;
        }
        let done = u64::from(skill_badges.min(target.skill_badges))
            + u64::from(arcade_games.min(target.arcade_games));
        let pct = (done as f64) * 100.0 / (total as f64);
        (pct * 100.0).round() / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub skill_badges: u32,
    pub arcade_games: u32,
    pub progress: String,
    pub percent: f64,
}

pub fn is_arcade_badge(title: &str) -> bool {
    title.contains(ARCADE_MARKER)
}

/// Splits badge titles into skill badges and arcade games and rates the counts
/// against `table`.
pub fn classify<S: AsRef<str>>(badge_titles: &[S], table: &ProgressTable) -> Classification {
    let arcade = badge_titles
        .iter()
        .filter(|t| is_arcade_badge(t.as_ref()))
        .count();
    let skill = badge_titles.len() - arcade;
    let skill_badges = u32::try_from(skill).unwrap_or(u32::MAX);
    let arcade_games = u32::try_from(arcade).unwrap_or(u32::MAX);

    Classification {
        skill_badges,
        arcade_games,
        progress: table.label_for(skill_badges, arcade_games).to_string(),
        percent: table.percent_for(skill_badges, arcade_games),
    }
}
