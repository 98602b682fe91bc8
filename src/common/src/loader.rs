use std::path::Path;

use serde::Deserialize;

use crate::model::SubjectRecord;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read subject file: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(default)]
    subject_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Load subjects from a CSV file with a `subject_id,email[,display_name]`
/// header. A row is accepted only if both identifier and email are non-empty
/// after trimming; malformed rows are dropped with a warning and never abort
/// the load.
pub fn load_subjects(path: &Path) -> Result<Vec<SubjectRecord>, LoadError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

    let mut subjects = Vec::new();
    let mut dropped = 0usize;

    for (row_num, result) in reader.deserialize::<RawRow>().enumerate() {
        // +2: header is line 1, enumerate starts at 0.
        let line = row_num + 2;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                log::warn!("line {line}: dropping unparseable row: {e}");
                dropped += 1;
                continue;
            }
        };

        let subject_id = row.subject_id.trim().to_string();
        let email = row.email.trim().to_string();
        if subject_id.is_empty() || email.is_empty() {
            log::warn!("line {line}: dropping row with missing subject_id or email");
            dropped += 1;
            continue;
        }

        let display_name = row
            .display_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        subjects.push(SubjectRecord {
            subject_id,
            email,
            display_name,
        });
    }

    log::info!(
        "loaded {} subjects from {} ({dropped} rows dropped)",
        subjects.len(),
        path.display()
    );
    Ok(subjects)
}
