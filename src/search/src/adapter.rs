use std::time::Duration;

use common::{FieldGroup, MaskOutcome, MaskingOperation, StoreKind, SubjectRecord, TargetPartition};
use tokio::time::Instant;

use crate::UpdateByQueryResponse;
use crate::client::SearchStore;
use crate::script;

/// How many residual documents the verification pass logs per partition.
const VERIFY_SAMPLE: usize = 3;

/// Drives masking across search-store partitions. Every public method is
/// total: store failures become `MaskOutcome::Failure` entries, never errors.
pub struct SearchAdapter<S: SearchStore> {
    store: S,
    poll_interval: Duration,
    max_wait: Duration,
}

impl<S: SearchStore> SearchAdapter<S> {
    pub fn new(store: S, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            store,
            poll_interval,
            max_wait,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Drops partitions whose index does not exist. Missing indexes are
    /// normal (resolved projects may never have been indexed) and are
    /// filtered silently at debug level.
    pub async fn filter_existing(&self, partitions: Vec<TargetPartition>) -> Vec<TargetPartition> {
        let mut existing = Vec::with_capacity(partitions.len());
        for partition in partitions {
            match self.store.index_exists(&partition.name).await {
                Ok(true) => existing.push(partition),
                Ok(false) => {
                    log::debug!("index {} does not exist, skipping", partition.name);
                }
                Err(e) => {
                    log::warn!("existence check for {} failed: {e}", partition.name);
                }
            }
        }
        existing
    }

    /// Masks both field groups in every partition. Partitions are
    /// independent: one partition's failure is recorded and the sweep
    /// continues.
    pub async fn mask_partitions(
        &self,
        subject: &SubjectRecord,
        partitions: &[TargetPartition],
    ) -> Vec<MaskingOperation> {
        let mut operations = Vec::with_capacity(partitions.len() * 2);
        for partition in partitions {
            for group in [FieldGroup::Identifier, FieldGroup::Email] {
                let spec = script::update_spec(group, &subject.subject_id, &subject.email);
                let (outcome, detail) = self.run_update(&partition.name, &spec).await;
                if let MaskOutcome::Failure(reason) = &outcome {
                    log::error!(
                        "masking {group} fields in {} for {} failed: {reason}",
                        partition.name,
                        subject.subject_id
                    );
                }
                operations.push(MaskingOperation {
                    subject_id: subject.subject_id.clone(),
                    store: StoreKind::Search,
                    partition: partition.name.clone(),
                    field_group: group,
                    outcome,
                    detail,
                });
            }
        }
        operations
    }

    /// Submits one update and waits for its outcome. An async task that
    /// outlives `max_wait` keeps running server-side, so it is reported as
    /// attempted rather than failed.
    async fn run_update(&self, index: &str, spec: &serde_json::Value) -> (MaskOutcome, Option<String>) {
        let response = match self.store.update_by_query(index, spec).await {
            Ok(r) => r,
            Err(e) => return (MaskOutcome::Failure(e.to_string()), None),
        };
        match response {
            UpdateByQueryResponse {
                task: Some(task_id),
                ..
            } => self.await_task(&task_id).await,
            UpdateByQueryResponse { updated, .. } => (classify_counts(updated.unwrap_or(0)), None),
        }
    }

    async fn await_task(&self, task_id: &str) -> (MaskOutcome, Option<String>) {
        let deadline = Instant::now() + self.max_wait;
        loop {
            match self.store.task_status(task_id).await {
                Ok(status) if status.completed => {
                    return (classify_counts(status.updated), None);
                }
                Ok(_) => {}
                Err(e) => return (MaskOutcome::Failure(e.to_string()), None),
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "task {task_id} still running after {:?}; leaving it to finish server-side",
                    self.max_wait
                );
                return (
                    MaskOutcome::Success(0),
                    Some(format!("task {task_id} attempted, completion not observed")),
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Counts documents still matching the subject across the given
    /// partitions, logging a small sample of offenders per partition. One
    /// partition's transport failure never hides residuals in the others.
    pub async fn verify(&self, subject: &SubjectRecord, partitions: &[TargetPartition]) -> u64 {
        let spec = script::verification_query(&subject.subject_id, &subject.email, VERIFY_SAMPLE);
        let mut residuals = 0;
        for partition in partitions {
            let hits = match self.store.search(&partition.name, &spec).await {
                Ok(hits) => hits,
                Err(e) => {
                    log::warn!(
                        "verification of {} failed: {e}; continuing with remaining partitions",
                        partition.name
                    );
                    continue;
                }
            };
            if hits.total == 0 {
                continue;
            }
            residuals += hits.total;
            for hit in hits.hits.iter().take(VERIFY_SAMPLE) {
                let fields =
                    script::offending_fields(&hit["_source"], &subject.subject_id, &subject.email);
                log::warn!(
                    "residual document in {}: id={} fields={fields:?}",
                    partition.name,
                    hit["_id"].as_str().unwrap_or("?")
                );
            }
        }
        residuals
    }
}

fn classify_counts(updated: u64) -> MaskOutcome {
    if updated > 0 {
        MaskOutcome::Success(updated)
    } else {
        MaskOutcome::Noop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SearchError;
    use crate::client::{MockSearchStore, SearchHits, TaskStatus};
    use common::ResolutionMethod;

    fn subject() -> SubjectRecord {
        SubjectRecord::new("abc-123", "user@example.com")
    }

    fn adapter(store: MockSearchStore) -> SearchAdapter<MockSearchStore> {
        SearchAdapter::new(store, Duration::from_millis(1), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn missing_indexes_are_filtered_silently() {
        let mut store = MockSearchStore::new();
        store
            .expect_index_exists()
            .returning(|index| Ok(index != "project-gone"));

        let partitions = vec![
            TargetPartition::search("project-a", ResolutionMethod::Waterfall),
            TargetPartition::search("project-gone", ResolutionMethod::Waterfall),
            TargetPartition::search("project-b", ResolutionMethod::Fallback),
        ];
        let existing = adapter(store).filter_existing(partitions).await;
        let names: Vec<&str> = existing.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["project-a", "project-b"]);
    }

    #[tokio::test]
    async fn one_failing_partition_does_not_stop_the_sweep() {
        let mut store = MockSearchStore::new();
        store.expect_update_by_query().returning(|index, _| {
            if index == "project-bad" {
                Err(SearchError::Status {
                    status: 500,
                    body: "shard failure".into(),
                })
            } else {
                Ok(UpdateByQueryResponse {
                    task: None,
                    updated: Some(2),
                    noops: Some(0),
                })
            }
        });

        let partitions = vec![
            TargetPartition::search("project-a", ResolutionMethod::Waterfall),
            TargetPartition::search("project-bad", ResolutionMethod::Waterfall),
            TargetPartition::search("project-b", ResolutionMethod::Waterfall),
        ];
        let ops = adapter(store).mask_partitions(&subject(), &partitions).await;

        assert_eq!(ops.len(), 6);
        let failures: Vec<_> = ops
            .iter()
            .filter(|op| matches!(op.outcome, MaskOutcome::Failure(_)))
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|op| op.partition == "project-bad"));
        assert!(
            ops.iter()
                .filter(|op| op.partition != "project-bad")
                .all(|op| matches!(op.outcome, MaskOutcome::Success(2)))
        );
    }

    #[tokio::test]
    async fn replay_lands_on_noop() {
        let mut store = MockSearchStore::new();
        store.expect_update_by_query().returning(|_, _| {
            Ok(UpdateByQueryResponse {
                task: None,
                updated: Some(0),
                noops: Some(4),
            })
        });

        let partitions = vec![TargetPartition::search(
            "project-a",
            ResolutionMethod::Waterfall,
        )];
        let ops = adapter(store).mask_partitions(&subject(), &partitions).await;
        assert!(ops.iter().all(|op| op.outcome == MaskOutcome::Noop));
    }

    #[tokio::test]
    async fn async_task_is_polled_to_completion() {
        let mut store = MockSearchStore::new();
        store.expect_update_by_query().returning(|_, _| {
            Ok(UpdateByQueryResponse {
                task: Some("node:42".into()),
                updated: None,
                noops: None,
            })
        });
        let mut polls = 0;
        store.expect_task_status().returning(move |_| {
            polls += 1;
            Ok(TaskStatus {
                completed: polls >= 3,
                updated: 9,
                noops: 0,
            })
        });

        let partitions = vec![TargetPartition::search(
            "project-a",
            ResolutionMethod::Waterfall,
        )];
        let ops = adapter(store).mask_partitions(&subject(), &partitions).await;
        assert!(
            ops.iter()
                .all(|op| op.outcome == MaskOutcome::Success(9))
        );
    }

    #[tokio::test]
    async fn timed_out_task_counts_as_attempted_not_failed() {
        let mut store = MockSearchStore::new();
        store.expect_update_by_query().returning(|_, _| {
            Ok(UpdateByQueryResponse {
                task: Some("node:slow".into()),
                updated: None,
                noops: None,
            })
        });
        store.expect_task_status().returning(|_| {
            Ok(TaskStatus {
                completed: false,
                updated: 0,
                noops: 0,
            })
        });

        let partitions = vec![TargetPartition::search(
            "project-a",
            ResolutionMethod::Waterfall,
        )];
        let ops = adapter(store).mask_partitions(&subject(), &partitions).await;
        for op in &ops {
            assert_eq!(op.outcome, MaskOutcome::Success(0));
            assert!(op.detail.as_deref().unwrap_or("").contains("attempted"));
        }
    }

    #[tokio::test]
    async fn verify_sums_residuals_across_partitions() {
        let mut store = MockSearchStore::new();
        store.expect_search().returning(|index, _| {
            let total = if index == "project-a" { 2 } else { 0 };
            Ok(SearchHits {
                total,
                hits: vec![serde_json::json!({
                    "_id": "doc-1",
                    "_source": { "worker_id": "abc-123" }
                })],
            })
        });

        let partitions = vec![
            TargetPartition::search("project-a", ResolutionMethod::Waterfall),
            TargetPartition::search("project-b", ResolutionMethod::Fallback),
        ];
        let residuals = adapter(store).verify(&subject(), &partitions).await;
        assert_eq!(residuals, 2);
    }

    #[tokio::test]
    async fn verify_continues_past_failing_partition() {
        let mut store = MockSearchStore::new();
        store.expect_search().returning(|index, _| {
            if index == "project-bad" {
                Err(SearchError::Status {
                    status: 500,
                    body: "shard failure".into(),
                })
            } else {
                Ok(SearchHits {
                    total: 4,
                    hits: vec![serde_json::json!({
                        "_id": "doc-1",
                        "_source": { "worker_id": "abc-123" }
                    })],
                })
            }
        });

        let partitions = vec![
            TargetPartition::search("project-bad", ResolutionMethod::Waterfall),
            TargetPartition::search("project-residual", ResolutionMethod::Fallback),
        ];
        let residuals = adapter(store).verify(&subject(), &partitions).await;
        assert_eq!(residuals, 4);
    }
}
