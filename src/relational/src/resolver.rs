use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use sqlx::postgres::PgConnection;
use tokio::sync::Mutex;

use common::SubjectRecord;

use crate::RelationalError;

/// Number of sharded distribution-segment tables (`_t0` through `_t9`).
pub const SEGMENT_SHARD_COUNT: usize = 10;

/// Search-store partition naming convention.
pub fn partition_name(project_id: &str) -> String {
    format!("project-{project_id}")
}

/// One lookup strategy in the resolution waterfall. Strategies are ordered,
/// progressively broader, and independently testable.
#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Project ids this strategy associates with the subject. An empty set
    /// is a valid answer, not an error.
    async fn resolve(&self, subject: &SubjectRecord) -> Result<BTreeSet<String>, RelationalError>;
}

/// Read-only lookup connection for the resolver strategies. Lazily created,
/// reused for the whole resolution phase.
pub struct PgLookup {
    dsn: String,
    conn: Option<PgConnection>,
}

impl PgLookup {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            conn: None,
        }
    }

    async fn conn(&mut self) -> Result<&mut PgConnection, RelationalError> {
        if self.conn.is_none() {
            let conn = PgConnection::connect(&self.dsn)
                .await
                .map_err(|e| RelationalError::Connect(e.to_string()))?;
            self.conn = Some(conn);
        }
        Ok(self.conn.as_mut().unwrap())
    }

    async fn project_ids(
        &mut self,
        sql: &str,
        subject_id: &str,
    ) -> Result<BTreeSet<String>, RelationalError> {
        let rows = sqlx::query_scalar::<_, String>(sql)
            .bind(subject_id)
            .fetch_all(self.conn().await?)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, RelationalError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(self.conn().await?)
        .await?;
        Ok(exists)
    }
}

type SharedLookup = Arc<Mutex<PgLookup>>;

/// Direct active-assignment mapping: the join the platform itself uses to
/// decide which projects a worker can touch.
pub struct ActiveAssignments {
    db: SharedLookup,
}

#[async_trait]
impl ResolveStrategy for ActiveAssignments {
    fn name(&self) -> &'static str {
        "active-assignments"
    }

    async fn resolve(&self, subject: &SubjectRecord) -> Result<BTreeSet<String>, RelationalError> {
        self.db
            .lock()
            .await
            .project_ids(
                "SELECT DISTINCT pj.project_id \
                 FROM proj_job_worker_t pjw \
                 JOIN proj_job_t pj ON pjw.job_id = pj.id \
                 WHERE pjw.worker_id = $1 \
                 AND pj.project_id IS NOT NULL \
                 AND pjw.status = 'ACTIVE'",
                &subject.subject_id,
            )
            .await
    }
}

/// Historical/inactive assignment mapping, without the ACTIVE filter.
pub struct AssignmentHistory {
    db: SharedLookup,
}

#[async_trait]
impl ResolveStrategy for AssignmentHistory {
    fn name(&self) -> &'static str {
        "assignment-history"
    }

    async fn resolve(&self, subject: &SubjectRecord) -> Result<BTreeSet<String>, RelationalError> {
        self.db
            .lock()
            .await
            .project_ids(
                "SELECT DISTINCT project_id \
                 FROM crowd_worker_job_mapping_t \
                 WHERE worker_id = $1 \
                 AND project_id IS NOT NULL",
                &subject.subject_id,
            )
            .await
    }
}

/// Secondary statistics and team mappings.
pub struct StatsAndTeams {
    db: SharedLookup,
}

#[async_trait]
impl ResolveStrategy for StatsAndTeams {
    fn name(&self) -> &'static str {
        "stats-and-teams"
    }

    async fn resolve(&self, subject: &SubjectRecord) -> Result<BTreeSet<String>, RelationalError> {
        let mut db = self.db.lock().await;
        let mut out = db
            .project_ids(
                "SELECT DISTINCT project_id \
                 FROM crowd_worker_project_stats_t \
                 WHERE worker_id = $1 \
                 AND project_id IS NOT NULL",
                &subject.subject_id,
            )
            .await?;
        // The team mapping table is younger than the stats table and may not
        // exist in older environments; treat its absence as empty, its
        // failure as the strategy's failure.
        match db
            .project_ids(
                "SELECT DISTINCT project_id \
                 FROM crowd_worker_team_mapping_t \
                 WHERE worker_id = $1 \
                 AND project_id IS NOT NULL",
                &subject.subject_id,
            )
            .await
        {
            Ok(teams) => out.extend(teams),
            Err(e) => log::debug!("team mapping lookup failed (table may not exist): {e}"),
        }
        Ok(out)
    }
}

/// Sharded fact tables, scanned for the subject in either the primary or the
/// secondary actor role. Each shard is existence-checked before querying.
pub struct ShardedSegments {
    db: SharedLookup,
}

#[async_trait]
impl ResolveStrategy for ShardedSegments {
    fn name(&self) -> &'static str {
        "sharded-segments"
    }

    async fn resolve(&self, subject: &SubjectRecord) -> Result<BTreeSet<String>, RelationalError> {
        let mut db = self.db.lock().await;
        let mut out = BTreeSet::new();
        for shard in 0..SEGMENT_SHARD_COUNT {
            let table = format!("distribution_segment_t{shard}");
            match db.table_exists(&table).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    log::debug!("existence check for {table} failed: {e}");
                    continue;
                }
            }
            let sql = format!(
                "SELECT DISTINCT project_id FROM {table} \
                 WHERE (worker_id = $1 OR last_annotator = $1) \
                 AND project_id IS NOT NULL"
            );
            match db.project_ids(&sql, &subject.subject_id).await {
                Ok(ids) => out.extend(ids),
                Err(e) => log::debug!("segment scan of {table} failed: {e}"),
            }
        }
        Ok(out)
    }
}

/// The ordered waterfall. Each step tolerates failure by logging and
/// continuing; results are unioned by partition name.
pub struct Resolver {
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl Resolver {
    pub fn new(strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { strategies }
    }

    /// The production waterfall over one shared lookup connection.
    pub fn for_store(dsn: &str) -> Self {
        let db: SharedLookup = Arc::new(Mutex::new(PgLookup::new(dsn)));
        Self::new(vec![
            Box::new(ActiveAssignments { db: db.clone() }),
            Box::new(AssignmentHistory { db: db.clone() }),
            Box::new(StatsAndTeams { db: db.clone() }),
            Box::new(ShardedSegments { db }),
        ])
    }

    /// De-duplicated partition names for the subject. Empty is a valid
    /// outcome ("no known targets"); one failed strategy never aborts
    /// resolution.
    pub async fn resolve(&self, subject: &SubjectRecord) -> BTreeSet<String> {
        let mut project_ids = BTreeSet::new();
        for strategy in &self.strategies {
            match strategy.resolve(subject).await {
                Ok(ids) => {
                    log::debug!(
                        "strategy {} resolved {} project ids for {}",
                        strategy.name(),
                        ids.len(),
                        subject.subject_id
                    );
                    project_ids.extend(ids);
                }
                Err(e) => {
                    log::warn!(
                        "strategy {} failed for {}: {e}; continuing waterfall",
                        strategy.name(),
                        subject.subject_id
                    );
                }
            }
        }
        project_ids.iter().map(|id| partition_name(id)).collect()
    }
}
