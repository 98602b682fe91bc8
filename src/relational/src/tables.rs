//! Fixed table policy for the relational store. Order is load-bearing: the
//! job-mapping table is the access-control gate and must be processed before
//! anything else, because its deactivation is what revokes platform access.

/// Tables with a `status` column, soft-deactivated in this exact order.
pub const STATUS_TABLES: [&str; 7] = [
    "crowd_worker_job_mapping_t",
    "crowd_workers_t",
    "crowd_worker_group_mapping_t",
    "crowd_worker_project_stats_t",
    "crowd_worker_team_mapping_t",
    "crowd_file_t",
    "work_job_pins_t",
];

/// The access-control gate; always `STATUS_TABLES[0]`.
pub const GATE_TABLE: &str = "crowd_worker_job_mapping_t";

/// The identity table, matched on its primary key `id` rather than the
/// generic `worker_id` column used everywhere else.
pub const IDENTITY_TABLE: &str = "crowd_workers_t";

/// Tables without a status column: counted for the audit trail, never mutated.
pub const AUDIT_TABLES: [&str; 3] = [
    "work_job_question_history_t",
    "work_job_interlock_deduct_t",
    "unit_giveup_log",
];

/// Mapping table keyed by a derived membership id instead of the subject id;
/// addressed through the identity table by email.
pub const PORTAL_MAPPING_TABLE: &str = "crowd_worker_portal_mapping_t";

/// Columns that are never mutation targets anywhere in this store.
pub const KEY_COLUMNS: [&str; 3] = ["id", "worker_id", "worker_project_id"];

/// One generated statement, kept structured so the write set is inspectable.
#[derive(Clone, Debug)]
pub struct TableStatement {
    pub table: &'static str,
    pub sql: String,
    /// Columns this statement writes.
    pub assignments: Vec<&'static str>,
}

/// Soft-deactivation for a plain status-bearing table.
pub fn deactivate_statement(table: &'static str) -> TableStatement {
    TableStatement {
        table,
        sql: format!("UPDATE {table} SET status = 'INACTIVE' WHERE worker_id = ANY($1)"),
        assignments: vec!["status"],
    }
}

/// The identity table gets one combined statement: mask PII and flip status.
/// `$2` is the per-batch email sentinel. The primary key is the predicate,
/// never a write target.
pub fn identity_mask_statement() -> TableStatement {
    TableStatement {
        table: IDENTITY_TABLE,
        sql: format!(
            "UPDATE {IDENTITY_TABLE} SET \
             status = 'INACTIVE', \
             name = 'DELETED_USER', \
             email_address = $2, \
             country = 'DELETED', \
             age = 'DELETED', \
             gender = 'DELETED', \
             ethnicity = 'DELETED', \
             language = 'DELETED', \
             updated_at = NOW(), \
             updated_by = 'datascrub' \
             WHERE id = ANY($1)"
        ),
        assignments: vec![
            "status",
            "name",
            "email_address",
            "country",
            "age",
            "gender",
            "ethnicity",
            "language",
            "updated_at",
            "updated_by",
        ],
    }
}

/// Audit-only tables are counted, never written.
pub fn audit_count_statement(table: &'static str) -> TableStatement {
    TableStatement {
        table,
        sql: format!("SELECT COUNT(*) FROM {table} WHERE worker_id = ANY($1)"),
        assignments: vec![],
    }
}

/// The portal mapping table has no subject-id column; it joins through the
/// identity table by email ($1 binds the batch email list).
pub fn portal_mapping_statement() -> TableStatement {
    TableStatement {
        table: PORTAL_MAPPING_TABLE,
        sql: format!(
            "UPDATE {PORTAL_MAPPING_TABLE} SET status = 'INACTIVE' \
             WHERE worker_project_id IN \
             (SELECT id FROM {IDENTITY_TABLE} WHERE email_address = ANY($1))"
        ),
        assignments: vec!["status"],
    }
}

/// Existence pre-check: batches where nobody exists any more are skipped.
pub fn identity_count_statement() -> TableStatement {
    TableStatement {
        table: IDENTITY_TABLE,
        sql: format!("SELECT COUNT(*) FROM {IDENTITY_TABLE} WHERE id = ANY($1)"),
        assignments: vec![],
    }
}
