use std::collections::BTreeSet;

use common::{ResolutionMethod, SubjectRecord, TargetPartition};

use crate::client::SearchStore;
use crate::script;

/// Pattern matching every per-project partition.
pub const PARTITION_PATTERN: &str = "project-*";

/// Last-resort target discovery for subjects the relational waterfall could
/// not place. Samples a bounded prefix of the partition namespace and probes
/// each index with a one-hit query; probing the full namespace would scale
/// with cluster size, not with the subject.
pub async fn discover_partitions<S: SearchStore>(
    store: &S,
    subject: &SubjectRecord,
    known: &BTreeSet<String>,
    sample: usize,
) -> Vec<TargetPartition> {
    let names = match store.list_indices(PARTITION_PATTERN).await {
        Ok(names) => names,
        Err(e) => {
            log::warn!("partition listing failed, discovery skipped: {e}");
            return Vec::new();
        }
    };
    log::info!(
        "discovery for {}: probing up to {sample} of {} partitions",
        subject.subject_id,
        names.len()
    );

    let probe = script::probe_query(&subject.subject_id, &subject.email);
    let mut found = Vec::new();
    for name in names
        .into_iter()
        .filter(|n| !known.contains(n))
        .take(sample)
    {
        match store.search(&name, &probe).await {
            Ok(hits) if hits.total > 0 => {
                log::info!("discovery hit in {name} for {}", subject.subject_id);
                found.push(TargetPartition::search(name, ResolutionMethod::Discovery));
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("discovery probe of {name} failed: {e}");
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SearchError;
    use crate::client::{MockSearchStore, SearchHits};

    fn subject() -> SubjectRecord {
        SubjectRecord::new("abc-123", "user@example.com")
    }

    #[tokio::test]
    async fn probes_only_the_sample_prefix() {
        let mut store = MockSearchStore::new();
        store.expect_list_indices().returning(|_| {
            Ok((0..20).map(|i| format!("project-{i}")).collect())
        });
        store
            .expect_search()
            .times(5)
            .returning(|_, _| Ok(SearchHits::default()));

        let found = discover_partitions(&store, &subject(), &BTreeSet::new(), 5).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn skips_already_known_partitions() {
        let mut store = MockSearchStore::new();
        store
            .expect_list_indices()
            .returning(|_| Ok(vec!["project-a".into(), "project-b".into()]));
        store.expect_search().returning(|index, _| {
            assert_ne!(index, "project-a");
            Ok(SearchHits {
                total: 1,
                hits: vec![],
            })
        });

        let known: BTreeSet<String> = ["project-a".to_string()].into_iter().collect();
        let found = discover_partitions(&store, &subject(), &known, 10).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "project-b");
        assert_eq!(found[0].method, ResolutionMethod::Discovery);
    }

    #[tokio::test]
    async fn listing_failure_yields_no_targets() {
        let mut store = MockSearchStore::new();
        store.expect_list_indices().returning(|_| {
            Err(SearchError::Status {
                status: 503,
                body: "unavailable".into(),
            })
        });

        let found = discover_partitions(&store, &subject(), &BTreeSet::new(), 10).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn probe_failure_skips_that_partition_only() {
        let mut store = MockSearchStore::new();
        store
            .expect_list_indices()
            .returning(|_| Ok(vec!["project-a".into(), "project-b".into()]));
        store.expect_search().returning(|index, _| {
            if index == "project-a" {
                Err(SearchError::Status {
                    status: 500,
                    body: "boom".into(),
                })
            } else {
                Ok(SearchHits {
                    total: 3,
                    hits: vec![],
                })
            }
        });

        let found = discover_partitions(&store, &subject(), &BTreeSet::new(), 10).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "project-b");
    }
}
