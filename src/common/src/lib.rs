pub mod config;
pub mod loader;
pub mod model;
pub mod stats;

pub use config::{
    AnalyticsConfig, Configuration, MaskingConfig, RelationalConfig, SearchConfig,
};
pub use loader::load_subjects;
pub use model::{
    FieldGroup, LimitationKind, MaskOutcome, MaskingOperation, ResolutionMethod, StoreKind,
    SubjectRecord, TargetPartition,
};
pub use stats::{Phase, PhaseTotals, RunStats, StoreTotals};

/// Replacement written over identifier fields.
pub const ID_SENTINEL: &str = "DELETED_USER";

/// Replacement written over email fields in the search and analytics stores.
pub const EMAIL_SENTINEL: &str = "deleted_user@deleted.com";

/// Per-batch email sentinel for the relational identity table, which carries a
/// uniqueness constraint on the email column.
pub fn batch_email_sentinel() -> String {
    format!("deleted_user_{}@deleted.com", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_sentinels_are_unique() {
        let a = batch_email_sentinel();
        let b = batch_email_sentinel();
        assert_ne!(a, b);
        assert!(a.starts_with("deleted_user_"));
        assert!(a.ends_with("@deleted.com"));
    }
}
