//! Public profile adapters: URL validation, page fetch, and badge extraction.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use sbt_core::{classify, ProfileRecord, ProgressTable, UNKNOWN_BADGE, UNKNOWN_NAME};
use sbt_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sbt-adapters";

pub const DEFAULT_PROFILE_PREFIX: &str = "https://www.skills.google/public_profiles/";

const NAME_SELECTOR: &str = "h1";
const BADGE_SELECTOR: &str = "div.profile-badge";
const BADGE_TITLE_SELECTOR: &str = "span";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("not a public profile url (expected prefix {prefix}): {url:?}")]
    InvalidInput { url: String, prefix: String },
    #[error("failed to fetch profile: http {status} for {url}")]
    Fetch { status: u16, url: String },
    #[error("profile request failed: {0}")]
    Request(#[source] FetchError),
    #[error("invalid selector: {0}")]
    Selector(String),
}

impl From<FetchError> for ProfileError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url } => ProfileError::Fetch { status, url },
            other => ProfileError::Request(other),
        }
    }
}

impl ProfileError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProfileError::Fetch { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Name and badge titles as they appear on a profile page, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedProfile {
    pub name: String,
    pub badge_titles: Vec<String>,
}

impl ParsedProfile {
    pub fn into_record(self, table: &ProgressTable) -> ProfileRecord {
        let classification = classify(&self.badge_titles, table);
        ProfileRecord::from_classification(self.name, classification)
    }
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, url: &str) -> Result<ProfileRecord, ProfileError>;
}

pub fn validate_profile_url(url: &str, prefix: &str) -> Result<(), ProfileError> {
    if url.starts_with(prefix) {
        Ok(())
    } else {
        Err(ProfileError::InvalidInput {
            url: url.to_string(),
            prefix: prefix.to_string(),
        })
    }
}

struct ProfileSelectors {
    name: Selector,
    badge: Selector,
    badge_title: Selector,
}

impl ProfileSelectors {
    fn parse() -> Result<Self, String> {
        let parse = |css: &str| Selector::parse(css).map_err(|e| format!("{css}: {e}"));
        Ok(Self {
            name: parse(NAME_SELECTOR)?,
            badge: parse(BADGE_SELECTOR)?,
            badge_title: parse(BADGE_TITLE_SELECTOR)?,
        })
    }
}

fn profile_selectors() -> Result<&'static ProfileSelectors, ProfileError> {
    static SELECTORS: OnceLock<Result<ProfileSelectors, String>> = OnceLock::new();
    SELECTORS
        .get_or_init(ProfileSelectors::parse)
        .as_ref()
        .map_err(|e| ProfileError::Selector(e.clone()))
}

fn element_text(node: ElementRef<'_>) -> String {
    node.text().collect::<String>().trim().to_string()
}

fn text_or_none(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Missing elements degrade to placeholder values instead of failing.
pub fn parse_profile_html(html: &str) -> Result<ParsedProfile, ProfileError> {
    let document = Html::parse_document(html);
    let selectors = profile_selectors()?;

    let name = document
        .select(&selectors.name)
        .next()
        .and_then(|n| text_or_none(element_text(n)))
        .unwrap_or_else(|| UNKNOWN_NAME.to_string());

    let badge_titles = document
        .select(&selectors.badge)
        .map(|badge| {
            badge
                .select(&selectors.badge_title)
                .next()
                .map(element_text)
                .unwrap_or_else(|| UNKNOWN_BADGE.to_string())
        })
        .collect();

    Ok(ParsedProfile { name, badge_titles })
}

/// Fetches live profile pages over HTTP.
pub struct SkillsBoostProfileSource {
    http: HttpFetcher,
    table: Arc<ProgressTable>,
    prefix: String,
}

impl SkillsBoostProfileSource {
    pub fn new(http: HttpFetcher, table: Arc<ProgressTable>) -> Self {
        Self {
            http,
            table,
            prefix: DEFAULT_PROFILE_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl ProfileSource for SkillsBoostProfileSource {
    async fn fetch_profile(&self, url: &str) -> Result<ProfileRecord, ProfileError> {
        validate_profile_url(url, &self.prefix)?;
        let page = self.http.fetch_text(url).await?;
        let parsed = parse_profile_html(&page.body)?;
        debug!(url, name = %parsed.name, badges = parsed.badge_titles.len(), "parsed profile");
        Ok(parsed.into_record(&self.table))
    }
}

/// Serves profile pages from memory through the same validate + parse path.
///
/// Unknown URLs behave like a `404` from the live site.
#[derive(Debug, Clone)]
pub struct FixtureProfileSource {
    pages: HashMap<String, String>,
    table: Arc<ProgressTable>,
    prefix: String,
}

impl FixtureProfileSource {
    pub fn new(table: Arc<ProgressTable>) -> Self {
        Self {
            pages: HashMap::new(),
            table,
            prefix: DEFAULT_PROFILE_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }
}

#[async_trait]
impl ProfileSource for FixtureProfileSource {
    async fn fetch_profile(&self, url: &str) -> Result<ProfileRecord, ProfileError> {
        validate_profile_url(url, &self.prefix)?;
        let Some(html) = self.pages.get(url) else {
            return Err(ProfileError::Fetch {
                status: 404,
                url: url.to_string(),
            });
        };
        Ok(parse_profile_html(html)?.into_record(&self.table))
    }
}
