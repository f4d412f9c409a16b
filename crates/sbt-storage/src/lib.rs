//! HTTP fetch utilities + spreadsheet upsert for SBT.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sbt_core::{header_row, CellValue, ProfileRecord, SHEET_HEADER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};

mod google;

pub use google::{GoogleSheetsBackend, ServiceAccountKey, SHEETS_SCOPES};

pub const CRATE_NAME: &str = "sbt-storage";

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` leaves requests without a deadline.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

/// Single-shot GET client. No retries, no rate limiting.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET `url` and return the body text; anything but `200 OK` is an error.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await?;
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("service account credentials: {0}")]
    Credentials(String),
    #[error("token exchange failed with status {status}: {body}")]
    Auth { status: u16, body: String },
    #[error("spreadsheet {name:?} not found or not shared with the service account")]
    SheetNotFound { name: String },
    #[error("spreadsheet {name:?} has no worksheets")]
    NoWorksheet { name: String },
    #[error("row {row} is outside sheet {sheet:?}")]
    RowOutOfRange { sheet: String, row: usize },
    #[error("sheets api returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("sheets request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected sheets response: {0}")]
    Decode(String),
}

/// Minimal row access a worksheet has to offer for upserts.
///
/// Row numbers are 1-based, the header occupies row 1.
#[async_trait]
pub trait SheetBackend: Send + Sync {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, SheetError>;

    async fn append_row(&self, sheet: &str, cells: &[CellValue]) -> Result<(), SheetError>;

    async fn update_row(
        &self,
        sheet: &str,
        row_number: usize,
        cells: &[CellValue],
    ) -> Result<(), SheetError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Clone)]
pub struct SheetUpserter {
    backend: Arc<dyn SheetBackend>,
}

impl SheetUpserter {
    pub fn new(backend: Arc<dyn SheetBackend>) -> Self {
        Self { backend }
    }

    /// Update the row whose `Name` matches `record.name` exactly, or append one.
    ///
    /// Writes the header first when the worksheet is empty. Not safe against
    /// other writers touching the same sheet at the same time.
    pub async fn upsert(
        &self,
        sheet: &str,
        record: &ProfileRecord,
    ) -> Result<UpsertOutcome, SheetError> {
        let mut rows = self.backend.read_rows(sheet).await?;
        if rows.is_empty() {
            self.backend.append_row(sheet, &header_row()).await?;
            rows.push(SHEET_HEADER.iter().map(|h| (*h).to_string()).collect());
        }

        let existing = rows
            .iter()
            .skip(1)
            .position(|row| row.first().map(String::as_str) == Some(record.name.as_str()));

        let cells = record.to_row();
        match existing {
            Some(index) => {
                let row_number = index + 2;
                self.backend.update_row(sheet, row_number, &cells).await?;
                info!(sheet, name = %record.name, row_number, "updated existing entry");
                Ok(UpsertOutcome::Updated)
            }
            None => {
                self.backend.append_row(sheet, &cells).await?;
                info!(sheet, name = %record.name, "added new entry");
                Ok(UpsertOutcome::Inserted)
            }
        }
    }
}

/// Process-local worksheets, keyed by sheet name.
#[derive(Debug, Default)]
pub struct InMemorySheetBackend {
    sheets: Mutex<HashMap<String, Vec<Vec<String>>>>,
}

impl InMemorySheetBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.sheets
            .lock()
            .await
            .get(sheet)
            .cloned()
            .unwrap_or_default()
    }
}

fn render_cells(cells: &[CellValue]) -> Vec<String> {
    cells.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl SheetBackend for InMemorySheetBackend {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, SheetError> {
        Ok(self.rows(sheet).await)
    }

    async fn append_row(&self, sheet: &str, cells: &[CellValue]) -> Result<(), SheetError> {
        self.sheets
            .lock()
            .await
            .entry(sheet.to_string())
            .or_default()
            .push(render_cells(cells));
        Ok(())
    }

    async fn update_row(
        &self,
        sheet: &str,
        row_number: usize,
        cells: &[CellValue],
    ) -> Result<(), SheetError> {
        let mut sheets = self.sheets.lock().await;
        let slot = sheets
            .get_mut(sheet)
            .and_then(|rows| row_number.checked_sub(1).and_then(|i| rows.get_mut(i)))
            .ok_or_else(|| SheetError::RowOutOfRange {
                sheet: sheet.to_string(),
                row: row_number,
            })?;
        *slot = render_cells(cells);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, skill_badges: u32, arcade_game: u32) -> ProfileRecord {
        ProfileRecord {
            name: name.to_string(),
            skill_badges,
            arcade_game,
            progress: "No progress".to_string(),
            percent: 0.0,
        }
    }

    fn header() -> Vec<String> {
        SHEET_HEADER.iter().map(|h| h.to_string()).collect()
    }

    #[tokio::test]
    async fn header_is_written_once_for_empty_sheet() {
        let backend = Arc::new(InMemorySheetBackend::new());
        let upserter = SheetUpserter::new(backend.clone());

        upserter.upsert("Tracker", &record("Ada", 1, 0)).await.unwrap();
        upserter.upsert("Tracker", &record("Grace", 2, 0)).await.unwrap();

        let rows = backend.rows("Tracker").await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], header());
        assert_eq!(rows.iter().filter(|r| **r == header()).count(), 1);
    }

    #[tokio::test]
    async fn same_name_twice_updates_in_place() {
        let backend = Arc::new(InMemorySheetBackend::new());
        let upserter = SheetUpserter::new(backend.clone());

        let first = upserter.upsert("Tracker", &record("Ada", 1, 0)).await.unwrap();
        let second = upserter.upsert("Tracker", &record("Ada", 5, 2)).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);
        let rows = backend.rows("Tracker").await;
        let ada_rows = rows.iter().filter(|r| r[0] == "Ada").collect::<Vec<_>>();
        assert_eq!(ada_rows.len(), 1);
        assert_eq!(ada_rows[0], &vec!["Ada", "5", "2", "No progress", "0"]);
    }

    #[tokio::test]
    async fn distinct_names_append_in_call_order() {
        let backend = Arc::new(InMemorySheetBackend::new());
        let upserter = SheetUpserter::new(backend.clone());

        let a = upserter.upsert("Tracker", &record("Ada", 1, 0)).await.unwrap();
        let b = upserter.upsert("Tracker", &record("Grace", 3, 1)).await.unwrap();

        assert_eq!((a, b), (UpsertOutcome::Inserted, UpsertOutcome::Inserted));
        let rows = backend.rows("Tracker").await;
        assert_eq!(rows[1][0], "Ada");
        assert_eq!(rows[2][0], "Grace");
    }

    #[tokio::test]
    async fn update_targets_first_match_below_header() {
        let backend = Arc::new(InMemorySheetBackend::new());
        for row in [
            header(),
            vec!["Linus".into(), "0".into()],
            vec![],
            vec!["Ada".into(), "1".into()],
            vec!["Ada".into(), "9".into()],
        ] {
            let cells = row.into_iter().map(CellValue::Text).collect::<Vec<_>>();
            backend.append_row("Tracker", &cells).await.unwrap();
        }

        let upserter = SheetUpserter::new(backend.clone());
        let outcome = upserter.upsert("Tracker", &record("Ada", 7, 0)).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated);
        let rows = backend.rows("Tracker").await;
        assert_eq!(rows[3][1], "7");
        assert_eq!(rows[4][1], "9");
    }

    #[tokio::test]
    async fn name_match_is_exact() {
        let backend = Arc::new(InMemorySheetBackend::new());
        let upserter = SheetUpserter::new(backend.clone());

        upserter.upsert("Tracker", &record("Ada", 1, 0)).await.unwrap();
        let outcome = upserter.upsert("Tracker", &record("ada ", 1, 0)).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(backend.rows("Tracker").await.len(), 3);
    }

    #[tokio::test]
    async fn in_memory_update_out_of_range_is_an_error() {
        let backend = InMemorySheetBackend::new();
        let err = backend
            .update_row("Tracker", 4, &[CellValue::Text("x".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, SheetError::RowOutOfRange { row: 4, .. }));
    }

    #[test]
    fn fetcher_builds_without_timeout() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default());
        assert!(fetcher.is_ok());
    }
}
