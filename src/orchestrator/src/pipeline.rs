use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use analytics::{AnalyticsAdapter, HttpAnalyticsClient, SqlClient};
use common::{
    Configuration, MaskOutcome, MaskingConfig, Phase, ResolutionMethod, RunStats, StoreKind,
    SubjectRecord, TargetPartition,
};
use relational::{PgExec, RelationalAdapter, Resolver, SqlExec};
use search::{HttpSearchClient, SearchAdapter, SearchStore, discover_partitions};

/// Runs the whole redaction workflow for one batch of subjects: resolution,
/// the three search sweeps, verification, analytics masking, and finally the
/// relational batch. Store order is fixed; the relational identity rows are
/// the lookup source for everything else and must go last.
pub struct Pipeline<S: SearchStore + 'static, C: SqlClient + 'static, E: SqlExec> {
    resolver: Arc<Resolver>,
    search: Arc<SearchAdapter<S>>,
    analytics: Arc<AnalyticsAdapter<C>>,
    relational: RelationalAdapter<E>,
    masking: MaskingConfig,
    dry_run: bool,
}

pub type ProductionPipeline = Pipeline<HttpSearchClient, HttpAnalyticsClient, PgExec>;

impl ProductionPipeline {
    pub fn from_config(config: &Configuration, dry_run: bool) -> anyhow::Result<Self> {
        let search_client = HttpSearchClient::new(&config.search.url, config.search.request_timeout)
            .context("Failed to build the search store client")?;
        let analytics_client = HttpAnalyticsClient::new(
            &config.analytics.url,
            &config.analytics.username,
            &config.analytics.password,
            config.analytics.request_timeout,
        )
        .context("Failed to build the analytics store client")?;
        Ok(Self::new(
            Resolver::for_store(&config.relational.dsn),
            SearchAdapter::new(
                search_client,
                config.search.task_poll_interval,
                config.search.task_max_wait,
            ),
            AnalyticsAdapter::new(analytics_client),
            RelationalAdapter::new(PgExec::new(&config.relational.dsn)),
            config.masking.clone(),
            dry_run,
        ))
    }
}

impl<S: SearchStore + 'static, C: SqlClient + 'static, E: SqlExec> Pipeline<S, C, E> {
    pub fn new(
        resolver: Resolver,
        search: SearchAdapter<S>,
        analytics: AnalyticsAdapter<C>,
        relational: RelationalAdapter<E>,
        masking: MaskingConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            resolver: Arc::new(resolver),
            search: Arc::new(search),
            analytics: Arc::new(analytics),
            relational,
            masking,
            dry_run,
        }
    }

    /// Processes every subject through a bounded worker pool, then runs the
    /// shared relational batch. Individual failures are counted, never
    /// propagated; the returned stats are the run's verdict.
    pub async fn run(mut self, subjects: Vec<SubjectRecord>) -> Arc<RunStats> {
        let stats = Arc::new(RunStats::new(subjects.len() as u64));
        let started = Instant::now();

        let permits = Arc::new(Semaphore::new(self.masking.worker_width.max(1)));
        let masking = Arc::new(self.masking.clone());
        let mut workers = JoinSet::new();
        for subject in subjects.clone() {
            let permits = permits.clone();
            let resolver = self.resolver.clone();
            let search = self.search.clone();
            let analytics = self.analytics.clone();
            let masking = masking.clone();
            let stats = stats.clone();
            let dry_run = self.dry_run;
            workers.spawn(async move {
                // Semaphore is never closed, so acquire cannot fail.
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                sweep_subject(
                    &resolver, &search, &analytics, &masking, &stats, dry_run, subject,
                )
                .await;
            });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                log::error!("subject worker panicked: {e}");
            }
        }

        if self.dry_run {
            log::info!(
                "dry run: would run the relational batch for {} subjects",
                subjects.len()
            );
        } else {
            match self.relational.deactivate_batch(&subjects).await {
                Ok(report) => {
                    let outcome = if report.skipped {
                        MaskOutcome::Noop
                    } else {
                        MaskOutcome::Success(report.rows_deactivated)
                    };
                    stats.record(StoreKind::Relational, &outcome);
                    log::info!(
                        "relational batch done: {} rows, {} reconnects, access_revoked={}",
                        report.rows_deactivated,
                        report.reconnects,
                        report.access_revoked
                    );
                }
                Err(e) => {
                    log::error!("relational batch failed: {e}");
                    stats.record(StoreKind::Relational, &MaskOutcome::Failure(e.to_string()));
                }
            }
        }

        stats.set_elapsed(started.elapsed());
        stats
    }
}

/// One subject's pass over the search and analytics stores.
async fn sweep_subject<S: SearchStore, C: SqlClient>(
    resolver: &Resolver,
    search: &SearchAdapter<S>,
    analytics: &AnalyticsAdapter<C>,
    masking: &MaskingConfig,
    stats: &RunStats,
    dry_run: bool,
    subject: SubjectRecord,
) {
    let resolved = resolver.resolve(&subject).await;
    log::info!(
        "{}: {} partitions resolved",
        subject.subject_id,
        resolved.len()
    );

    let fallback_names: BTreeSet<&str> = masking
        .fallback_partitions
        .iter()
        .map(String::as_str)
        .collect();
    let fallback: Vec<TargetPartition> = masking
        .fallback_partitions
        .iter()
        .map(|name| TargetPartition::search(name, ResolutionMethod::Fallback))
        .collect();
    let targeted: Vec<TargetPartition> = resolved
        .iter()
        .filter(|name| !fallback_names.contains(name.as_str()))
        .map(|name| TargetPartition::search(name, ResolutionMethod::Waterfall))
        .collect();

    let fallback = search.filter_existing(fallback).await;
    let targeted = search.filter_existing(targeted).await;

    if dry_run {
        let all: Vec<TargetPartition> = fallback.into_iter().chain(targeted).collect();
        let hits = search.verify(&subject, &all).await;
        log::info!(
            "dry run {}: {hits} documents across {} partitions would be masked",
            subject.subject_id,
            all.len()
        );
        stats.record_residuals(hits);
        return;
    }

    for op in search.mask_partitions(&subject, &fallback).await {
        stats.record(StoreKind::Search, &op.outcome);
        stats.record_phase(Phase::FallbackSweep, &op.outcome);
    }
    for op in search.mask_partitions(&subject, &targeted).await {
        stats.record(StoreKind::Search, &op.outcome);
        stats.record_phase(Phase::TargetedSweep, &op.outcome);
    }

    let mut discovered = Vec::new();
    if resolved.len() < masking.discovery_threshold {
        log::info!(
            "{}: only {} resolved partitions, running discovery",
            subject.subject_id,
            resolved.len()
        );
        let known: BTreeSet<String> = fallback
            .iter()
            .chain(targeted.iter())
            .map(|p| p.name.clone())
            .collect();
        discovered =
            discover_partitions(search.store(), &subject, &known, masking.discovery_sample).await;
        for op in search.mask_partitions(&subject, &discovered).await {
            stats.record(StoreKind::Search, &op.outcome);
            stats.record_phase(Phase::DiscoverySweep, &op.outcome);
        }
    }

    let all: Vec<TargetPartition> = fallback
        .into_iter()
        .chain(targeted)
        .chain(discovered)
        .collect();
    match search.verify(&subject, &all).await {
        0 => log::debug!("{}: no residual documents", subject.subject_id),
        hits => {
            log::warn!("{}: {hits} residual documents remain", subject.subject_id);
            stats.record_residuals(hits);
        }
    }

    for op in analytics.mask_subject(&subject).await {
        stats.record(StoreKind::Analytics, &op.outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analytics::client::MockSqlClient;
    use async_trait::async_trait;
    use relational::adapter::MockSqlExec;
    use relational::{RelationalError, ResolveStrategy};
    use search::client::{MockSearchStore, SearchHits, UpdateByQueryResponse};

    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl ResolveStrategy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn resolve(
            &self,
            _subject: &SubjectRecord,
        ) -> Result<BTreeSet<String>, RelationalError> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    fn resolver(projects: Vec<&'static str>) -> Resolver {
        Resolver::new(vec![Box::new(Fixed(projects))])
    }

    fn subjects() -> Vec<SubjectRecord> {
        vec![SubjectRecord::new("abc-123", "user@example.com")]
    }

    fn quiet_search_store() -> MockSearchStore {
        let mut store = MockSearchStore::new();
        store.expect_index_exists().returning(|_| Ok(true));
        store.expect_update_by_query().returning(|_, _| {
            Ok(UpdateByQueryResponse {
                task: None,
                updated: Some(1),
                noops: Some(0),
            })
        });
        store
            .expect_search()
            .returning(|_, _| Ok(SearchHits::default()));
        store.expect_list_indices().returning(|_| Ok(vec![]));
        store
    }

    fn quiet_analytics() -> MockSqlClient {
        let mut client = MockSqlClient::new();
        client.expect_execute().returning(|sql| {
            if sql.contains("unit_metrics_topic") {
                Err(analytics::AnalyticsError::Status {
                    status: 500,
                    body: "Table engine Kafka doesn't support mutations".into(),
                })
            } else {
                Ok(String::new())
            }
        });
        client
    }

    fn clean_relational() -> MockSqlExec {
        let mut exec = MockSqlExec::new();
        exec.expect_connect().returning(|| Ok(()));
        exec.expect_count().returning(|sql, _| {
            if sql.contains("crowd_workers_t") {
                Ok(1)
            } else {
                Ok(0)
            }
        });
        exec.expect_begin().returning(|| Ok(()));
        exec.expect_update().returning(|_, _| Ok(1));
        exec.expect_update_with_sentinel().returning(|_, _, _| Ok(1));
        exec.expect_commit().returning(|| Ok(()));
        exec
    }

    fn pipeline(
        resolver: Resolver,
        store: MockSearchStore,
        client: MockSqlClient,
        exec: MockSqlExec,
        dry_run: bool,
    ) -> Pipeline<MockSearchStore, MockSqlClient, MockSqlExec> {
        Pipeline::new(
            resolver,
            SearchAdapter::new(
                store,
                std::time::Duration::from_millis(1),
                std::time::Duration::from_millis(50),
            ),
            AnalyticsAdapter::new(client),
            RelationalAdapter::new(exec),
            MaskingConfig::default(),
            dry_run,
        )
    }

    #[tokio::test]
    async fn full_run_touches_every_store_without_failures() {
        let stats = pipeline(
            resolver(vec!["p1"]),
            quiet_search_store(),
            quiet_analytics(),
            clean_relational(),
            false,
        )
        .run(subjects())
        .await;

        // Fallback partition plus project-p1, two field groups each.
        let search_totals = stats.store_totals(StoreKind::Search);
        assert_eq!(search_totals.attempted, 4);
        assert_eq!(search_totals.succeeded, 4);

        let analytics_totals = stats.store_totals(StoreKind::Analytics);
        // The streaming-engine table rejects its mutation.
        assert_eq!(analytics_totals.expected_limitations, 1);
        assert_eq!(analytics_totals.failures, 0);

        let relational_totals = stats.store_totals(StoreKind::Relational);
        // 6 plain status tables + identity + portal mapping, one row each.
        assert_eq!(relational_totals.records_touched, 8);

        assert_eq!(stats.total_failures(), 0);
        assert_eq!(stats.phase_totals(Phase::FallbackSweep).operations, 2);
        assert_eq!(stats.phase_totals(Phase::TargetedSweep).operations, 2);
    }

    #[tokio::test]
    async fn discovery_runs_only_below_the_threshold() {
        for (projects, expect_discovery) in [
            (vec![], true),
            (vec!["p1", "p2"], true),
            (vec!["p1", "p2", "p3"], false),
        ] {
            let mut store = MockSearchStore::new();
            store.expect_index_exists().returning(|_| Ok(true));
            store.expect_update_by_query().returning(|_, _| {
                Ok(UpdateByQueryResponse {
                    task: None,
                    updated: Some(0),
                    noops: Some(0),
                })
            });
            store
                .expect_search()
                .returning(|_, _| Ok(SearchHits::default()));
            store
                .expect_list_indices()
                .times(usize::from(expect_discovery))
                .returning(|_| Ok(vec![]));

            let stats = pipeline(
                resolver(projects),
                store,
                quiet_analytics(),
                clean_relational(),
                false,
            )
            .run(subjects())
            .await;
            assert_eq!(stats.total_failures(), 0);
        }
    }

    #[tokio::test]
    async fn discovered_partitions_are_swept() {
        let mut store = MockSearchStore::new();
        store.expect_index_exists().returning(|_| Ok(true));
        store
            .expect_list_indices()
            .returning(|_| Ok(vec!["project-found".into()]));
        // Discovery probe hits; verification afterwards is clean.
        let mut searches = 0;
        store.expect_search().returning(move |_, _| {
            searches += 1;
            if searches == 1 {
                Ok(SearchHits {
                    total: 1,
                    hits: vec![],
                })
            } else {
                Ok(SearchHits::default())
            }
        });
        store.expect_update_by_query().returning(|index, _| {
            Ok(UpdateByQueryResponse {
                task: None,
                updated: Some(u64::from(index == "project-found")),
                noops: Some(0),
            })
        });

        let stats = pipeline(
            resolver(vec![]),
            store,
            quiet_analytics(),
            clean_relational(),
            false,
        )
        .run(subjects())
        .await;

        let discovery = stats.phase_totals(Phase::DiscoverySweep);
        assert_eq!(discovery.operations, 2);
        assert_eq!(discovery.failures, 0);
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing() {
        let mut store = MockSearchStore::new();
        store.expect_index_exists().returning(|_| Ok(true));
        store.expect_update_by_query().times(0);
        store.expect_search().returning(|_, _| {
            Ok(SearchHits {
                total: 5,
                hits: vec![],
            })
        });

        let mut client = MockSqlClient::new();
        client.expect_execute().times(0);

        let mut exec = MockSqlExec::new();
        exec.expect_connect().times(0);
        exec.expect_update().times(0);

        let stats = pipeline(resolver(vec!["p1"]), store, client, exec, true)
            .run(subjects())
            .await;

        assert_eq!(stats.store_totals(StoreKind::Search).attempted, 0);
        assert_eq!(stats.store_totals(StoreKind::Analytics).attempted, 0);
        assert_eq!(stats.store_totals(StoreKind::Relational).attempted, 0);
    }

    #[tokio::test]
    async fn relational_connect_failure_is_counted_not_fatal() {
        let mut exec = MockSqlExec::new();
        exec.expect_connect()
            .returning(|| Err(RelationalError::Connect("refused".into())));

        let stats = pipeline(
            resolver(vec!["p1"]),
            quiet_search_store(),
            quiet_analytics(),
            exec,
            false,
        )
        .run(subjects())
        .await;

        assert_eq!(stats.store_totals(StoreKind::Relational).failures, 1);
        // Search and analytics work is unaffected.
        assert_eq!(stats.store_totals(StoreKind::Search).failures, 0);
    }
}
