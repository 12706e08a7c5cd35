//! Fetch collaborators: turn a configured source into a list of external records.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::ExternalRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-adapters";

pub const ASHBY_BOARD_API: &str = "https://api.ashbyhq.com/posting-api/job-board";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetcherKind {
    Fixture,
    Ashby,
}

/// Where a fetcher should look for one company's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTarget {
    pub company_id: Uuid,
    #[serde(default)]
    pub board: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Misconfigured(String),
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn kind(&self) -> FetcherKind;

    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<ExternalRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Reads a JSON array of external records from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureFetcher;

pub async fn load_fixture_records(
    path: impl AsRef<Path>,
) -> Result<Vec<ExternalRecord>, FetchError> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| FetchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&data).map_err(|source| FetchError::Decode {
        origin: path.display().to_string(),
        source,
    })
}

#[async_trait]
impl SourceFetcher for FixtureFetcher {
    fn kind(&self) -> FetcherKind {
        FetcherKind::Fixture
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<ExternalRecord>, FetchError> {
        let path = target.fixture_path.as_ref().ok_or_else(|| {
            FetchError::Misconfigured(format!(
                "fixture fetcher for company {} has no fixture_path",
                target.company_id
            ))
        })?;
        load_fixture_records(path).await
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AshbyBoard {
    jobs: Vec<AshbyJob>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AshbyJob {
    id: Option<String>,
    title: Option<String>,
    location: Option<String>,
    department: Option<String>,
    employment_type: Option<String>,
    job_url: Option<String>,
    apply_url: Option<String>,
    published_at: Option<String>,
    description_html: Option<String>,
    description_plain: Option<String>,
    is_listed: Option<bool>,
    compensation: Option<JsonValue>,
    address: Option<JsonValue>,
}

impl From<AshbyJob> for ExternalRecord {
    fn from(job: AshbyJob) -> Self {
        let published_at = job
            .published_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));
        ExternalRecord {
            external_id: job.id,
            title: job.title,
            location: job.location,
            description_html: job.description_html,
            description_plain: job.description_plain,
            department: job.department,
            employment_type: job.employment_type,
            job_url: job.job_url,
            apply_url: job.apply_url,
            published_at,
            compensation: job.compensation,
            location_detail: job.address,
        }
    }
}

/// Maps an Ashby job-board payload. Unlisted postings are dropped.
pub fn parse_ashby_board(body: &[u8]) -> Result<Vec<ExternalRecord>, FetchError> {
    let board: AshbyBoard = serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        origin: "ashby job board".to_string(),
        source,
    })?;
    Ok(board
        .jobs
        .into_iter()
        .filter(|job| job.is_listed != Some(false))
        .map(ExternalRecord::from)
        .collect())
}

/// Public Ashby posting API. One attempt per fetch; retries belong to the caller.
#[derive(Debug, Clone)]
pub struct AshbyFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl AshbyFetcher {
    pub fn new(config: &HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            base_url: ASHBY_BOARD_API.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn board_url(&self, board: &str) -> String {
        format!(
            "{}/{}?includeCompensation=true",
            self.base_url.trim_end_matches('/'),
            board
        )
    }
}

#[async_trait]
impl SourceFetcher for AshbyFetcher {
    fn kind(&self) -> FetcherKind {
        FetcherKind::Ashby
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<ExternalRecord>, FetchError> {
        let board = target.board.as_deref().ok_or_else(|| {
            FetchError::Misconfigured(format!(
                "ashby fetcher for company {} has no board",
                target.company_id
            ))
        })?;
        let url = self.board_url(board);
        let span = info_span!("ashby_fetch", company_id = %target.company_id, board);

        async {
            let resp = self.client.get(&url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?;
            let records = parse_ashby_board(&body)?;
            debug!(records = records.len(), "ashby board fetched");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}

pub fn fetcher_for(
    kind: FetcherKind,
    http: &HttpClientConfig,
) -> Result<Box<dyn SourceFetcher>, FetchError> {
    match kind {
        FetcherKind::Fixture => Ok(Box::new(FixtureFetcher)),
        FetcherKind::Ashby => Ok(Box::new(AshbyFetcher::new(http)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn ashby_board_fixture_maps_to_external_records() {
        let path = workspace_root()
            .join("fixtures")
            .join("ashby")
            .join("sample")
            .join("board.json");
        let body = std::fs::read(&path).expect("read board fixture");
        let records = parse_ashby_board(&body).expect("parse board");

        assert_eq!(records.len(), 3, "unlisted posting is dropped");
        let first = &records[0];
        assert_eq!(first.external_id(), Some("5d1c3b6e-0001"));
        assert_eq!(first.title.as_deref(), Some("Senior Backend Engineer"));
        assert_eq!(first.location.as_deref(), Some("Remote - US"));
        assert_eq!(first.employment_type.as_deref(), Some("FullTime"));
        assert!(first.compensation.is_some());
        assert!(first.location_detail.is_some());
        assert_eq!(
            first.published_at.map(|ts| ts.to_rfc3339()),
            Some("2026-02-10T15:30:00+00:00".to_string())
        );
        assert_eq!(first.change_content(), first.description_plain.as_deref());
    }

    #[test]
    fn ashby_board_tolerates_missing_fields() {
        let records = parse_ashby_board(br#"{"jobs":[{"title":"No id"}]}"#).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id(), None);

        let err = parse_ashby_board(b"not json").unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn board_url_includes_compensation() {
        let fetcher = AshbyFetcher::new(&HttpClientConfig::default())
            .unwrap()
            .with_base_url("http://localhost:9999/board/");
        assert_eq!(
            fetcher.board_url("acme"),
            "http://localhost:9999/board/acme?includeCompensation=true"
        );
    }

    #[tokio::test]
    async fn fixture_fetcher_reads_record_array() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"external_id":"a","title":"Engineer","description_plain":"x"}},{{"title":"missing id"}}]"#
        )
        .unwrap();

        let target = FetchTarget {
            company_id: Uuid::new_v4(),
            board: None,
            fixture_path: Some(file.path().to_path_buf()),
        };
        let records = FixtureFetcher.fetch(&target).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].external_id(), Some("a"));
        assert_eq!(records[1].external_id(), None);
    }

    #[tokio::test]
    async fn fixture_fetcher_requires_a_path() {
        let target = FetchTarget {
            company_id: Uuid::new_v4(),
            board: None,
            fixture_path: None,
        };
        let err = FixtureFetcher.fetch(&target).await.unwrap_err();
        assert!(matches!(err, FetchError::Misconfigured(_)));

        let missing = FetchTarget {
            fixture_path: Some(PathBuf::from("/definitely/not/here.json")),
            ..target
        };
        assert!(matches!(
            FixtureFetcher.fetch(&missing).await.unwrap_err(),
            FetchError::Io { .. }
        ));
    }
}
