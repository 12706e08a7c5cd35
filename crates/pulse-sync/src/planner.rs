//! Diff of persisted records against a fresh fetch.
//!
//! Every incoming external id lands in exactly one of create/update; every active row
//! missing from the fetch lands in remove. Planning is pure: no I/O, no clock reads.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use pulse_core::{
    fingerprint, ExternalRecord, NewRecord, PersistedRecordSummary, RecordContent,
};
use serde::Serialize;
use uuid::Uuid;

use crate::normalize::normalize;

/// Company + source being reconciled, and the instant used for every timestamp in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanScope {
    pub company_id: Uuid,
    pub source: String,
    pub now: DateTime<Utc>,
}

/// Existing row observed again. Presence alone refreshes `last_seen_at` and clears
/// `removed_at`; `changed` says whether the content must be rewritten too.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateEntry {
    pub id: Uuid,
    pub external_id: String,
    pub content: RecordContent,
    pub changed: bool,
    /// The row was soft-deleted before this cycle.
    pub reactivated: bool,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveEntry {
    pub id: Uuid,
    pub external_id: String,
    pub removed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    MissingExternalId,
    DuplicateExternalId { external_id: String },
}

/// Incoming record rejected before planning; `index` is its position in the fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationPlan {
    pub company_id: Uuid,
    pub source: String,
    pub to_create: Vec<NewRecord>,
    pub to_update: Vec<UpdateEntry>,
    pub to_remove: Vec<RemoveEntry>,
    pub skipped: Vec<SkippedRecord>,
}

impl ReconciliationPlan {
    pub fn changed(&self) -> impl Iterator<Item = &UpdateEntry> {
        self.to_update.iter().filter(|u| u.changed)
    }

    pub fn unchanged(&self) -> impl Iterator<Item = &UpdateEntry> {
        self.to_update.iter().filter(|u| !u.changed)
    }

    pub fn changed_count(&self) -> usize {
        self.changed().count()
    }
}

/// Normalized fields and fingerprint for one incoming record.
pub fn record_content(record: ExternalRecord) -> RecordContent {
    let normalized = normalize(record.title.as_deref(), record.location.as_deref());
    let fingerprint = fingerprint(record.change_content());
    RecordContent {
        title: record.title,
        location: record.location,
        department: record.department,
        employment_type: record.employment_type,
        job_url: record.job_url,
        apply_url: record.apply_url,
        published_at: record.published_at,
        description_html: record.description_html,
        description_plain: record.description_plain,
        compensation: record.compensation,
        location_detail: record.location_detail,
        normalized,
        fingerprint,
    }
}

pub fn plan(
    existing: &[PersistedRecordSummary],
    incoming: Vec<ExternalRecord>,
    scope: &PlanScope,
) -> ReconciliationPlan {
    let by_external_id: HashMap<&str, &PersistedRecordSummary> = existing
        .iter()
        .map(|summary| (summary.external_id.as_str(), summary))
        .collect();

    let mut seen: HashSet<String> = HashSet::with_capacity(incoming.len());
    let mut to_create = Vec::new();
    let mut to_update = Vec::new();
    let mut skipped = Vec::new();

    for (index, record) in incoming.into_iter().enumerate() {
        let Some(external_id) = record.external_id().map(str::to_string) else {
            skipped.push(SkippedRecord {
                index,
                reason: SkipReason::MissingExternalId,
            });
            continue;
        };
        if !seen.insert(external_id.clone()) {
            skipped.push(SkippedRecord {
                index,
                reason: SkipReason::DuplicateExternalId { external_id },
            });
            continue;
        }

        let content = record_content(record);
        match by_external_id.get(external_id.as_str()) {
            Some(existing) => to_update.push(UpdateEntry {
                id: existing.id,
                changed: content.fingerprint != existing.fingerprint,
                reactivated: !existing.is_active(),
                external_id,
                content,
                last_seen_at: scope.now,
            }),
            None => to_create.push(NewRecord {
                company_id: scope.company_id,
                source: scope.source.clone(),
                external_id,
                content,
                first_seen_at: scope.now,
                last_seen_at: scope.now,
            }),
        }
    }

    let to_remove = existing
        .iter()
        .filter(|summary| summary.is_active() && !seen.contains(&summary.external_id))
        .map(|summary| RemoveEntry {
            id: summary.id,
            external_id: summary.external_id.clone(),
            removed_at: scope.now,
        })
        .collect();

    ReconciliationPlan {
        company_id: scope.company_id,
        source: scope.source.clone(),
        to_create,
        to_update,
        to_remove,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_core::{RemoteType, SeniorityLevel};

    fn scope() -> PlanScope {
        PlanScope {
            company_id: Uuid::from_u128(7),
            source: "ashby".into(),
            now: Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).single().unwrap(),
        }
    }

    fn incoming(external_id: &str, description: &str) -> ExternalRecord {
        ExternalRecord {
            external_id: Some(external_id.into()),
            title: Some("Senior Engineer".into()),
            location: Some("Remote".into()),
            description_plain: Some(description.into()),
            ..Default::default()
        }
    }

    fn existing(external_id: &str, description: &str, removed: bool) -> PersistedRecordSummary {
        PersistedRecordSummary {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            fingerprint: fingerprint(Some(description)),
            removed_at: removed
                .then(|| Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()),
        }
    }

    fn ids<'a>(iter: impl Iterator<Item = &'a str>) -> HashSet<String> {
        iter.map(str::to_string).collect()
    }

    #[test]
    fn new_records_become_creates_with_matching_seen_timestamps() {
        let plan = plan(&[], vec![incoming("a", "x")], &scope());
        assert_eq!(plan.to_create.len(), 1);
        let created = &plan.to_create[0];
        assert_eq!(created.external_id, "a");
        assert_eq!(created.first_seen_at, scope().now);
        assert_eq!(created.last_seen_at, scope().now);
        assert_eq!(created.company_id, scope().company_id);
        assert_eq!(created.content.normalized.remote_type, RemoteType::Remote);
        assert_eq!(
            created.content.normalized.seniority_level,
            SeniorityLevel::Senior
        );
        assert!(plan.to_update.is_empty() && plan.to_remove.is_empty());
    }

    #[test]
    fn partial_change_flags_only_differing_fingerprints() {
        let existing: Vec<_> = (0..5)
            .map(|i| existing(&format!("job-{i}"), &format!("body {i}"), false))
            .collect();
        let incoming: Vec<_> = (0..5)
            .map(|i| {
                let body = if i < 2 {
                    format!("body {i} (edited)")
                } else {
                    format!("body {i}")
                };
                incoming(&format!("job-{i}"), &body)
            })
            .collect();

        let plan = plan(&existing, incoming, &scope());
        assert!(plan.to_create.is_empty());
        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.to_update.len(), 5);
        assert_eq!(plan.changed_count(), 2);
        assert_eq!(plan.unchanged().count(), 3);
        assert!(plan.to_update.iter().all(|u| u.last_seen_at == scope().now));
    }

    #[test]
    fn empty_fetch_removes_every_active_record() {
        let existing: Vec<_> = (0..10)
            .map(|i| existing(&format!("job-{i}"), "same", false))
            .collect();
        let plan = plan(&existing, Vec::new(), &scope());
        assert_eq!(plan.to_remove.len(), 10);
        assert!(plan.to_create.is_empty());
        assert!(plan.to_update.is_empty());
        assert!(plan.to_remove.iter().all(|r| r.removed_at == scope().now));
    }

    #[test]
    fn already_removed_rows_are_not_removed_again() {
        let existing = vec![existing("gone", "x", true), existing("live", "y", false)];
        let plan = plan(&existing, Vec::new(), &scope());
        assert_eq!(plan.to_remove.len(), 1);
        assert_eq!(plan.to_remove[0].external_id, "live");
    }

    #[test]
    fn reappearing_record_is_an_unchanged_reactivating_update() {
        let existing = vec![existing("back", "same body", true)];
        let plan = plan(&existing, vec![incoming("back", "same body")], &scope());
        assert!(plan.to_create.is_empty());
        assert_eq!(plan.to_update.len(), 1);
        let update = &plan.to_update[0];
        assert_eq!(update.id, existing[0].id);
        assert!(!update.changed);
        assert!(update.reactivated);
        assert_eq!(plan.changed_count(), 0);
    }

    #[test]
    fn malformed_and_duplicate_records_are_skipped() {
        let mut blank = incoming("  ", "x");
        blank.title = Some("blank id".into());
        let missing = ExternalRecord {
            title: Some("no id".into()),
            ..Default::default()
        };
        let plan = plan(
            &[],
            vec![
                incoming("a", "first"),
                missing,
                incoming("a", "second"),
                blank,
            ],
            &scope(),
        );

        assert_eq!(plan.to_create.len(), 1);
        assert_eq!(
            plan.to_create[0].content.fingerprint,
            fingerprint(Some("first"))
        );
        assert_eq!(
            plan.skipped,
            vec![
                SkippedRecord {
                    index: 1,
                    reason: SkipReason::MissingExternalId
                },
                SkippedRecord {
                    index: 2,
                    reason: SkipReason::DuplicateExternalId {
                        external_id: "a".into()
                    }
                },
                SkippedRecord {
                    index: 3,
                    reason: SkipReason::MissingExternalId
                },
            ]
        );
    }

    #[test]
    fn plan_sets_partition_active_and_incoming_ids() {
        let existing = vec![
            existing("keep-same", "1", false),
            existing("keep-edit", "2", false),
            existing("drop", "3", false),
            existing("revive", "4", true),
            existing("stay-gone", "5", true),
        ];
        let incoming = vec![
            incoming("keep-same", "1"),
            incoming("keep-edit", "2b"),
            incoming("revive", "4"),
            incoming("brand-new", "6"),
        ];
        let plan = plan(&existing, incoming, &scope());

        let created = ids(plan.to_create.iter().map(|c| c.external_id.as_str()));
        let updated = ids(plan.to_update.iter().map(|u| u.external_id.as_str()));
        let removed = ids(plan.to_remove.iter().map(|r| r.external_id.as_str()));

        assert!(created.is_disjoint(&updated));
        assert!(created.is_disjoint(&removed));
        assert!(updated.is_disjoint(&removed));

        let union: HashSet<String> = created
            .union(&updated)
            .chain(removed.iter())
            .cloned()
            .collect();
        let expected = ids(
            ["keep-same", "keep-edit", "drop", "revive", "brand-new"]
                .into_iter(),
        );
        assert_eq!(union, expected);
        assert_eq!(removed, ids(["drop"].into_iter()));
        assert_eq!(plan.changed_count(), 1);
    }

    #[test]
    fn fingerprint_uses_plain_text_over_html() {
        let existing = vec![existing("a", "plain body", false)];
        let record = ExternalRecord {
            external_id: Some("a".into()),
            description_html: Some("<p>plain body</p>".into()),
            description_plain: Some("plain body".into()),
            ..Default::default()
        };
        let plan = plan(&existing, vec![record], &scope());
        assert!(!plan.to_update[0].changed);
    }
}
