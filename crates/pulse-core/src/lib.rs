//! Core domain model for company signal reconciliation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-core";

/// SHA-256 digest of a record's change-relevant content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentFingerprint([u8; 32]);

impl ContentFingerprint {
    /// Missing content hashes the same as the empty string.
    pub fn of(content: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.unwrap_or_default().as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(input: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(input.trim(), &mut bytes).ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentFingerprint({})", self.to_hex())
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<ContentFingerprint> for String {
    fn from(value: ContentFingerprint) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for ContentFingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid content fingerprint `{value}`"))
    }
}

pub fn fingerprint(content: Option<&str>) -> ContentFingerprint {
    ContentFingerprint::of(content)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    Remote,
    Hybrid,
    Onsite,
}

impl RemoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteType::Remote => "remote",
            RemoteType::Hybrid => "hybrid",
            RemoteType::Onsite => "onsite",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "remote" => Some(RemoteType::Remote),
            "hybrid" => Some(RemoteType::Hybrid),
            "onsite" => Some(RemoteType::Onsite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeniorityLevel {
    Intern,
    Entry,
    Mid,
    Senior,
    Staff,
    Executive,
}

impl SeniorityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeniorityLevel::Intern => "intern",
            SeniorityLevel::Entry => "entry",
            SeniorityLevel::Mid => "mid",
            SeniorityLevel::Senior => "senior",
            SeniorityLevel::Staff => "staff",
            SeniorityLevel::Executive => "executive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "intern" => Some(SeniorityLevel::Intern),
            "entry" => Some(SeniorityLevel::Entry),
            "mid" => Some(SeniorityLevel::Mid),
            "senior" => Some(SeniorityLevel::Senior),
            "staff" => Some(SeniorityLevel::Staff),
            "executive" => Some(SeniorityLevel::Executive),
            _ => None,
        }
    }
}

/// Categorical fields derived from free-text title/location. Recomputed every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedFields {
    pub remote_type: RemoteType,
    pub seniority_level: SeniorityLevel,
}

/// Provider-shaped record handed from a fetcher to the reconciler. Lives for one cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalRecord {
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub description_html: Option<String>,
    pub description_plain: Option<String>,
    pub department: Option<String>,
    pub employment_type: Option<String>,
    pub job_url: Option<String>,
    pub apply_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Opaque provider payload, passed through untouched.
    pub compensation: Option<JsonValue>,
    /// Opaque structured location (address blocks etc.), passed through untouched.
    pub location_detail: Option<JsonValue>,
}

impl ExternalRecord {
    /// The reconciliation key, or `None` when missing or blank.
    pub fn external_id(&self) -> Option<&str> {
        self.external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Text used for change detection: plain description wins over HTML.
    pub fn change_content(&self) -> Option<&str> {
        self.description_plain
            .as_deref()
            .or(self.description_html.as_deref())
    }
}

/// Content columns of a persisted record, as last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordContent {
    pub title: Option<String>,
    pub location: Option<String>,
    pub department: Option<String>,
    pub employment_type: Option<String>,
    pub job_url: Option<String>,
    pub apply_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub description_html: Option<String>,
    pub description_plain: Option<String>,
    pub compensation: Option<JsonValue>,
    pub location_detail: Option<JsonValue>,
    pub normalized: NormalizedFields,
    pub fingerprint: ContentFingerprint,
}

/// Insert shape for a record seen for the first time. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewRecord {
    pub company_id: Uuid,
    pub source: String,
    pub external_id: String,
    pub content: RecordContent,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: Uuid,
    pub company_id: Uuid,
    pub source: String,
    pub external_id: String,
    pub content: RecordContent,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl PersistedRecord {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }

    pub fn summary(&self) -> PersistedRecordSummary {
        PersistedRecordSummary {
            id: self.id,
            external_id: self.external_id.clone(),
            fingerprint: self.content.fingerprint,
            removed_at: self.removed_at,
        }
    }
}

/// What the planner needs to know about an existing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecordSummary {
    pub id: Uuid,
    pub external_id: String,
    pub fingerprint: ContentFingerprint,
    pub removed_at: Option<DateTime<Utc>>,
}

impl PersistedRecordSummary {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub found: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// One audit row per reconciliation cycle. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub company_id: Uuid,
    pub source: String,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Active-record counts by normalized category. Removed rows never contribute.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ActiveDistribution {
    pub total: usize,
    pub by_remote_type: BTreeMap<RemoteType, usize>,
    pub by_seniority: BTreeMap<SeniorityLevel, usize>,
}

impl ActiveDistribution {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PersistedRecord>) -> Self {
        let mut out = Self::default();
        for record in records.into_iter().filter(|r| r.is_active()) {
            out.total += 1;
            *out
                .by_remote_type
                .entry(record.content.normalized.remote_type)
                .or_default() += 1;
            *out
                .by_seniority
                .entry(record.content.normalized.seniority_level)
                .or_default() += 1;
        }
        out
    }
}
