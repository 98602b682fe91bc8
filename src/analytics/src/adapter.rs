use common::{
    EMAIL_SENTINEL, FieldGroup, ID_SENTINEL, LimitationKind, MaskOutcome, MaskingOperation,
    StoreKind, SubjectRecord,
};

use crate::AnalyticsError;
use crate::client::{SqlClient, sql_quote};
use crate::tokens::{LIST_SEPARATOR, mask_token_list};

/// Predicate shape for one table. The identifier column is a partition/sort
/// key in this store and is only ever a predicate, never a write target;
/// email is the one maskable field.
#[derive(Clone, Copy, Debug)]
pub enum MatchRule {
    /// Rows matched by identifier or email; email masked.
    ByIdOrEmail {
        id_column: &'static str,
        email_column: &'static str,
    },
    /// The table has no identifier column at all.
    ByEmailOnly { email_column: &'static str },
}

#[derive(Clone, Copy, Debug)]
pub struct TablePolicy {
    pub table: &'static str,
    pub rule: MatchRule,
}

/// Every mutation-style analytics table. The store itself still gets the
/// last word; rejections it is known to issue are classified below.
pub const TABLE_POLICIES: [TablePolicy; 4] = [
    TablePolicy {
        table: "metrics.unit_metrics",
        rule: MatchRule::ByIdOrEmail {
            id_column: "worker_id",
            email_column: "worker_email",
        },
    },
    TablePolicy {
        table: "metrics.unit_metrics_hourly",
        rule: MatchRule::ByIdOrEmail {
            id_column: "worker_id",
            email_column: "worker_email",
        },
    },
    TablePolicy {
        table: "metrics.unit_metrics_topic",
        rule: MatchRule::ByIdOrEmail {
            id_column: "worker_id",
            email_column: "worker_email",
        },
    },
    TablePolicy {
        table: "metrics.accrued_worker_stats",
        rule: MatchRule::ByEmailOnly {
            email_column: "email",
        },
    },
];

/// Legacy per-unit rollup whose annotator column is a delimited list, so it
/// cannot be masked with a plain column update.
pub const LEGACY_LIST_TABLE: &str = "metrics.unit_annotators";
const LEGACY_KEY_COLUMN: &str = "unit_id";
const LEGACY_LIST_COLUMN: &str = "annotators";

/// Store error texts that prove the data cannot be mutated where it sits.
const REJECTION_PATTERNS: [(&str, LimitationKind); 3] = [
    ("doesn't support mutations", LimitationKind::ImmutableEngine),
    ("Cannot UPDATE key column", LimitationKind::KeyColumn),
    ("There is no column", LimitationKind::MissingColumn),
];

fn classify_rejection(body: &str) -> Option<LimitationKind> {
    REJECTION_PATTERNS
        .iter()
        .find(|(needle, _)| body.contains(needle))
        .map(|(_, kind)| *kind)
}

/// The one mutation statement for a policy table. The write set is always
/// exactly the email column; identifiers appear in the predicate only.
fn statement_for(policy: &TablePolicy, subject: &SubjectRecord) -> String {
    match policy.rule {
        MatchRule::ByIdOrEmail {
            id_column,
            email_column,
        } => format!(
            "ALTER TABLE {} UPDATE {email_column} = {} WHERE {id_column} = {} OR {email_column} = {}",
            policy.table,
            sql_quote(EMAIL_SENTINEL),
            sql_quote(&subject.subject_id),
            sql_quote(&subject.email)
        ),
        MatchRule::ByEmailOnly { email_column } => format!(
            "ALTER TABLE {} UPDATE {email_column} = {} WHERE {email_column} = {}",
            policy.table,
            sql_quote(EMAIL_SENTINEL),
            sql_quote(&subject.email)
        ),
    }
}

pub struct AnalyticsAdapter<C: SqlClient> {
    client: C,
}

impl<C: SqlClient> AnalyticsAdapter<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Masks the subject across every analytics table. Never fails as a
    /// whole: each statement's outcome is recorded independently.
    pub async fn mask_subject(&self, subject: &SubjectRecord) -> Vec<MaskingOperation> {
        let mut operations = Vec::with_capacity(TABLE_POLICIES.len() + 1);
        for policy in TABLE_POLICIES {
            let outcome = self.submit(&statement_for(&policy, subject)).await;
            if let MaskOutcome::Failure(reason) = &outcome {
                log::error!(
                    "masking email fields in {} for {} failed: {reason}",
                    policy.table,
                    subject.subject_id
                );
            }
            operations.push(MaskingOperation {
                subject_id: subject.subject_id.clone(),
                store: StoreKind::Analytics,
                partition: policy.table.to_string(),
                field_group: FieldGroup::Email,
                outcome,
                detail: None,
            });
        }
        operations.push(self.mask_legacy_lists(subject).await);
        operations
    }

    /// Submits one mutation; the store applies it asynchronously, so
    /// acceptance is the success signal, not a row count.
    async fn submit(&self, sql: &str) -> MaskOutcome {
        match self.client.execute(sql).await {
            Ok(_) => MaskOutcome::Success(0),
            Err(AnalyticsError::Status { body, .. }) => match classify_rejection(&body) {
                Some(kind) => {
                    log::info!("store rejected mutation as expected ({kind:?}): {body}");
                    MaskOutcome::ExpectedLimitation(kind)
                }
                None => MaskOutcome::Failure(body),
            },
            Err(e) => MaskOutcome::Failure(e.to_string()),
        }
    }

    /// Rewrites delimited annotator lists row by row. The exact-token rule
    /// cannot be expressed as a column update, so matching rows are rebuilt
    /// in process and written back individually.
    async fn mask_legacy_lists(&self, subject: &SubjectRecord) -> MaskingOperation {
        let outcome = match self.rewrite_lists(subject).await {
            Ok(0) => MaskOutcome::Noop,
            Ok(rows) => MaskOutcome::Success(rows),
            Err(AnalyticsError::Status { body, .. }) => match classify_rejection(&body) {
                Some(kind) => MaskOutcome::ExpectedLimitation(kind),
                None => MaskOutcome::Failure(body),
            },
            Err(e) => MaskOutcome::Failure(e.to_string()),
        };
        if let MaskOutcome::Failure(reason) = &outcome {
            log::error!(
                "legacy list masking in {LEGACY_LIST_TABLE} for {} failed: {reason}",
                subject.subject_id
            );
        }
        MaskingOperation {
            subject_id: subject.subject_id.clone(),
            store: StoreKind::Analytics,
            partition: LEGACY_LIST_TABLE.to_string(),
            field_group: FieldGroup::Identifier,
            outcome,
            detail: None,
        }
    }

    async fn rewrite_lists(&self, subject: &SubjectRecord) -> Result<u64, AnalyticsError> {
        let select = format!(
            "SELECT {LEGACY_KEY_COLUMN}, {LEGACY_LIST_COLUMN} FROM {LEGACY_LIST_TABLE} \
             WHERE has(splitByString('{LIST_SEPARATOR}', {LEGACY_LIST_COLUMN}), {}) \
             FORMAT JSONEachRow",
            sql_quote(&subject.subject_id)
        );
        let body = self.client.execute(&select).await?;

        let mut rows = 0;
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let row: serde_json::Value = match serde_json::from_str(line) {
                Ok(row) => row,
                Err(e) => {
                    log::warn!("unparseable row from {LEGACY_LIST_TABLE}: {e}");
                    continue;
                }
            };
            let (Some(key), Some(list)) = (
                row[LEGACY_KEY_COLUMN].as_str(),
                row[LEGACY_LIST_COLUMN].as_str(),
            ) else {
                continue;
            };
            let masked = mask_token_list(list, &subject.subject_id, ID_SENTINEL);
            if masked == list {
                continue;
            }
            let update = format!(
                "ALTER TABLE {LEGACY_LIST_TABLE} UPDATE {LEGACY_LIST_COLUMN} = {} \
                 WHERE {LEGACY_KEY_COLUMN} = {}",
                sql_quote(&masked),
                sql_quote(key)
            );
            self.client.execute(&update).await?;
            rows += 1;
        }
        Ok(rows)
    }
}
