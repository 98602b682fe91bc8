use serde::{Deserialize, Serialize};

/// One individual whose PII must be erased. Built once by the loader and
/// read-only afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject_id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl SubjectRecord {
    pub fn new(subject_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            email: email.into(),
            display_name: None,
        }
    }
}

/// Which backing store a partition or operation belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    Relational,
    Search,
    Analytics,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Relational => write!(f, "relational"),
            StoreKind::Search => write!(f, "search"),
            StoreKind::Analytics => write!(f, "analytics"),
        }
    }
}

/// How a search-store partition ended up in the target set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMethod {
    /// Member of the fixed always-check set.
    Fallback,
    /// Produced by one of the resolver waterfall strategies.
    Waterfall,
    /// Found by dynamic discovery probing.
    Discovery,
}

/// One physical location (index, shard or table) that may hold subject data.
/// Built per subject per run; never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPartition {
    pub store: StoreKind,
    pub name: String,
    pub method: ResolutionMethod,
    pub exists: bool,
}

impl TargetPartition {
    pub fn search(name: impl Into<String>, method: ResolutionMethod) -> Self {
        Self {
            store: StoreKind::Search,
            name: name.into(),
            method,
            exists: true,
        }
    }
}

/// Why a store rejected a mutation in a way we recognize and accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitationKind {
    /// The predicate column is a partition/sort key the store refuses to write.
    KeyColumn,
    /// The table is backed by a streaming/log engine that rejects mutations.
    ImmutableEngine,
    /// The table has no identifier column at all.
    MissingColumn,
}

/// Outcome of one redaction attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskOutcome {
    /// The statement executed and touched this many documents/rows. A count
    /// of zero is still Success: the store accepted the write.
    Success(u64),
    /// Nothing matched or nothing changed value; replays land here.
    Noop,
    /// A recognized store-enforced rejection; counts as a compliance success
    /// since the rejection proves no mutable identifying data exists there.
    ExpectedLimitation(LimitationKind),
    /// Unclassified failure; logged, never fatal to the run.
    Failure(String),
}

impl MaskOutcome {
    /// Whether this outcome counts toward the compliance-success total.
    pub fn is_compliant(&self) -> bool {
        !matches!(self, MaskOutcome::Failure(_))
    }
}

/// One redaction attempt against one partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaskingOperation {
    pub subject_id: String,
    pub store: StoreKind,
    pub partition: String,
    pub field_group: FieldGroup,
    pub outcome: MaskOutcome,
    pub detail: Option<String>,
}

/// Identifier and email fields are masked independently so one field type's
/// failure never blocks the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldGroup {
    Identifier,
    Email,
}

impl std::fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldGroup::Identifier => write!(f, "identifier"),
            FieldGroup::Email => write!(f, "email"),
        }
    }
}
