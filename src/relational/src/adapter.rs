use async_trait::async_trait;
use sqlx::Connection;
use sqlx::postgres::PgConnection;

use common::SubjectRecord;

use crate::RelationalError;
use crate::tables::{
    AUDIT_TABLES, IDENTITY_TABLE, STATUS_TABLES, audit_count_statement, deactivate_statement,
    identity_count_statement, identity_mask_statement, portal_mapping_statement,
};

/// Minimal SQL surface the adapter drives. One implementation per store
/// connection; tests substitute a mock.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait SqlExec: Send {
    /// Discard any existing connection and establish a fresh one.
    async fn connect(&mut self) -> Result<(), RelationalError>;
    async fn begin(&mut self) -> Result<(), RelationalError>;
    async fn commit(&mut self) -> Result<(), RelationalError>;
    async fn rollback(&mut self) -> Result<(), RelationalError>;
    /// Trivial no-op statement used to detect an aborted transaction.
    async fn probe(&mut self) -> Result<(), RelationalError>;
    async fn update(&mut self, sql: &str, keys: &[String]) -> Result<u64, RelationalError>;
    async fn update_with_sentinel(
        &mut self,
        sql: &str,
        keys: &[String],
        sentinel: &str,
    ) -> Result<u64, RelationalError>;
    async fn count(&mut self, sql: &str, keys: &[String]) -> Result<i64, RelationalError>;
}

/// Production executor: one lazily-created PostgreSQL connection, reused for
/// the whole batch, never shared across workers.
pub struct PgExec {
    dsn: String,
    conn: Option<PgConnection>,
}

impl PgExec {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            conn: None,
        }
    }

    async fn conn(&mut self) -> Result<&mut PgConnection, RelationalError> {
        if self.conn.is_none() {
            self.connect_inner().await?;
        }
        Ok(self.conn.as_mut().unwrap())
    }

    async fn connect_inner(&mut self) -> Result<(), RelationalError> {
        let conn = PgConnection::connect(&self.dsn)
            .await
            .map_err(|e| RelationalError::Connect(e.to_string()))?;
        self.conn = Some(conn);
        Ok(())
    }
}

#[async_trait]
impl SqlExec for PgExec {
    async fn connect(&mut self) -> Result<(), RelationalError> {
        self.conn = None;
        self.connect_inner().await
    }

    async fn begin(&mut self) -> Result<(), RelationalError> {
        sqlx::query("BEGIN").execute(self.conn().await?).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), RelationalError> {
        sqlx::query("COMMIT").execute(self.conn().await?).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RelationalError> {
        sqlx::query("ROLLBACK").execute(self.conn().await?).await?;
        Ok(())
    }

    async fn probe(&mut self) -> Result<(), RelationalError> {
        sqlx::query("SELECT 1").execute(self.conn().await?).await?;
        Ok(())
    }

    async fn update(&mut self, sql: &str, keys: &[String]) -> Result<u64, RelationalError> {
        let result = sqlx::query(sql).bind(keys).execute(self.conn().await?).await?;
        Ok(result.rows_affected())
    }

    async fn update_with_sentinel(
        &mut self,
        sql: &str,
        keys: &[String],
        sentinel: &str,
    ) -> Result<u64, RelationalError> {
        let result = sqlx::query(sql)
            .bind(keys)
            .bind(sentinel)
            .execute(self.conn().await?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&mut self, sql: &str, keys: &[String]) -> Result<i64, RelationalError> {
        let n = sqlx::query_scalar::<_, i64>(sql)
            .bind(keys)
            .fetch_one(self.conn().await?)
            .await?;
        Ok(n)
    }
}

/// Result of one relational batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelationalReport {
    /// Rows deactivated/masked inside committed transactions.
    pub rows_deactivated: u64,
    /// Whether the gate-table statement nominally succeeded.
    pub access_revoked: bool,
    /// Times the adapter had to roll back and reconnect mid-batch.
    pub reconnects: u32,
    /// True when no subject existed and the batch was skipped.
    pub skipped: bool,
}

/// Deactivates/masks a batch of subjects across the fixed table sequence,
/// all statements sharing one transaction on one connection.
pub struct RelationalAdapter<E: SqlExec> {
    exec: E,
}

impl<E: SqlExec> RelationalAdapter<E> {
    pub fn new(exec: E) -> Self {
        Self { exec }
    }

    /// Run the full table sequence for one batch. Connection failure is the
    /// only error that escapes; everything else degrades to per-table
    /// warnings and the recovery path.
    pub async fn deactivate_batch(
        &mut self,
        subjects: &[SubjectRecord],
    ) -> Result<RelationalReport, RelationalError> {
        let ids: Vec<String> = subjects.iter().map(|s| s.subject_id.clone()).collect();
        let emails: Vec<String> = subjects.iter().map(|s| s.email.clone()).collect();

        // Force a fresh connection before the transaction-critical sequence.
        self.exec.connect().await?;

        let existing = self
            .exec
            .count(&identity_count_statement().sql, &ids)
            .await?;
        if existing == 0 {
            log::info!("no subjects present in {IDENTITY_TABLE}; batch already erased, skipping");
            return Ok(RelationalReport {
                skipped: true,
                ..RelationalReport::default()
            });
        }
        log::info!("{existing}/{} subjects present in {IDENTITY_TABLE}", ids.len());

        self.exec.begin().await?;

        let mut report = RelationalReport::default();
        // Rows affected inside the currently open transaction; discarded on
        // rollback, folded into the report only at commit.
        let mut pending: u64 = 0;
        let sentinel = common::batch_email_sentinel();

        for (index, table) in STATUS_TABLES.into_iter().enumerate() {
            let result = if table == IDENTITY_TABLE {
                let stmt = identity_mask_statement();
                self.exec.update_with_sentinel(&stmt.sql, &ids, &sentinel).await
            } else {
                let stmt = deactivate_statement(table);
                self.exec.update(&stmt.sql, &ids).await
            };

            match result {
                Ok(rows) => {
                    pending += rows;
                    if index == 0 {
                        report.access_revoked = true;
                    }
                    if rows > 0 {
                        log::info!("deactivated {rows} rows in {table}");
                    } else {
                        log::debug!("no rows to deactivate in {table}");
                    }
                }
                Err(e) => {
                    log::warn!("statement against {table} failed: {e}");
                    self.recover(&mut pending, &mut report.reconnects).await?;
                }
            }
        }

        for table in AUDIT_TABLES {
            let stmt = audit_count_statement(table);
            match self.exec.count(&stmt.sql, &ids).await {
                Ok(n) if n > 0 => {
                    log::info!("{n} rows remain in {table} (no status column, audit only)");
                }
                Ok(_) => log::debug!("no rows in {table}"),
                Err(e) => {
                    log::warn!("audit count against {table} failed: {e}");
                    self.recover(&mut pending, &mut report.reconnects).await?;
                }
            }
        }

        let portal = portal_mapping_statement();
        match self.exec.update(&portal.sql, &emails).await {
            Ok(rows) => {
                pending += rows;
                if rows > 0 {
                    log::info!("deactivated {rows} rows in {}", portal.table);
                }
            }
            Err(e) => {
                log::warn!("statement against {} failed: {e}", portal.table);
                self.recover(&mut pending, &mut report.reconnects).await?;
            }
        }

        match self.exec.commit().await {
            Ok(()) => report.rows_deactivated += pending,
            Err(e) => {
                // Uncommitted work never counts toward the success total.
                log::error!("commit failed, discarding {pending} pending rows: {e}");
            }
        }

        Ok(report)
    }

    /// After a statement error, decide whether the transaction survived. An
    /// aborted transaction is rolled back and a fresh connection plus a new
    /// transaction are established; rows pending in the dead transaction are
    /// discarded. We never keep issuing statements against an aborted
    /// transaction.
    async fn recover(
        &mut self,
        pending: &mut u64,
        reconnects: &mut u32,
    ) -> Result<(), RelationalError> {
        if self.exec.probe().await.is_ok() {
            log::debug!("transaction still active, continuing with next table");
            return Ok(());
        }

        log::warn!("transaction aborted; rolling back and reconnecting");
        let _ = self.exec.rollback().await;
        *pending = 0;
        self.exec.connect().await?;
        self.exec.begin().await?;
        *reconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subjects() -> Vec<SubjectRecord> {
        vec![
            SubjectRecord::new("abc-123", "user@example.com"),
            SubjectRecord::new("def-456", "other@example.com"),
        ]
    }

    fn count_responder(sql: &str) -> Result<i64, RelationalError> {
        if sql.contains(IDENTITY_TABLE) {
            Ok(2)
        } else {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn skips_batch_when_no_subject_exists() {
        let mut exec = MockSqlExec::new();
        exec.expect_connect().times(1).returning(|| Ok(()));
        exec.expect_count().times(1).returning(|_, _| Ok(0));
        // No begin/commit may happen.
        exec.expect_begin().times(0);

        let mut adapter = RelationalAdapter::new(exec);
        let report = adapter.deactivate_batch(&subjects()).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.rows_deactivated, 0);
    }

    #[tokio::test]
    async fn clean_batch_commits_all_tables() {
        let mut exec = MockSqlExec::new();
        exec.expect_connect().times(1).returning(|| Ok(()));
        exec.expect_count().returning(|sql, _| count_responder(sql));
        exec.expect_begin().times(1).returning(|| Ok(()));
        // 6 plain status tables + portal mapping.
        exec.expect_update().times(7).returning(|_, _| Ok(1));
        exec.expect_update_with_sentinel()
            .times(1)
            .returning(|_, _, _| Ok(2));
        exec.expect_commit().times(1).returning(|| Ok(()));

        let mut adapter = RelationalAdapter::new(exec);
        let report = adapter.deactivate_batch(&subjects()).await.unwrap();
        assert_eq!(report.rows_deactivated, 9);
        assert!(report.access_revoked);
        assert_eq!(report.reconnects, 0);
    }

    #[tokio::test]
    async fn aborted_transaction_rolls_back_reconnects_and_continues() {
        let mut exec = MockSqlExec::new();
        // Initial connect plus one reconnect after the abort.
        exec.expect_connect().times(2).returning(|| Ok(()));
        exec.expect_count().returning(|sql, _| count_responder(sql));
        exec.expect_begin().times(2).returning(|| Ok(()));
        // The identity statement dies and leaves the transaction aborted.
        exec.expect_update_with_sentinel()
            .times(1)
            .returning(|_, _, _| Err(RelationalError::Store("duplicate key".into())));
        exec.expect_probe()
            .times(1)
            .returning(|| Err(RelationalError::Store("current transaction is aborted".into())));
        exec.expect_rollback().times(1).returning(|| Ok(()));
        // Gate (rolled back) + 5 remaining status tables + portal mapping.
        exec.expect_update().times(7).returning(|_, _| Ok(1));
        exec.expect_commit().times(1).returning(|| Ok(()));

        let mut adapter = RelationalAdapter::new(exec);
        let report = adapter.deactivate_batch(&subjects()).await.unwrap();

        // The gate row was rolled back with the dead transaction; only the
        // fresh transaction's 6 rows commit.
        assert_eq!(report.rows_deactivated, 6);
        assert_eq!(report.reconnects, 1);
        assert!(report.access_revoked);
    }

    #[tokio::test]
    async fn statement_error_with_live_transaction_continues_in_place() {
        let mut exec = MockSqlExec::new();
        exec.expect_connect().times(1).returning(|| Ok(()));
        exec.expect_count().returning(|sql, _| count_responder(sql));
        exec.expect_begin().times(1).returning(|| Ok(()));
        let mut calls = 0u32;
        exec.expect_update().times(7).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(RelationalError::Store("relation does not exist".into()))
            } else {
                Ok(1)
            }
        });
        exec.expect_update_with_sentinel()
            .times(1)
            .returning(|_, _, _| Ok(1));
        // The error did not abort the transaction.
        exec.expect_probe().times(1).returning(|| Ok(()));
        exec.expect_commit().times(1).returning(|| Ok(()));

        let mut adapter = RelationalAdapter::new(exec);
        let report = adapter.deactivate_batch(&subjects()).await.unwrap();
        assert_eq!(report.rows_deactivated, 7);
        assert_eq!(report.reconnects, 0);
        // Gate statement failed, so access revocation did not nominally succeed.
        assert!(!report.access_revoked);
    }

    #[tokio::test]
    async fn connect_failure_propagates() {
        let mut exec = MockSqlExec::new();
        exec.expect_connect()
            .times(1)
            .returning(|| Err(RelationalError::Connect("refused".into())));

        let mut adapter = RelationalAdapter::new(exec);
        assert!(adapter.deactivate_batch(&subjects()).await.is_err());
    }
}
