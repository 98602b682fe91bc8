use serde_json::{Value, json};

use common::{EMAIL_SENTINEL, FieldGroup, ID_SENTINEL};

/// Top-level document fields carrying the subject's identifier.
pub const ID_FIELDS: [&str; 2] = ["worker_id", "qa_checker_id"];

/// Nested single objects holding per-period actor data.
pub const NESTED_OBJECTS: [&str; 2] = ["latest", "earliest"];

/// Identifier fields inside nested objects and history entries.
pub const NESTED_ID_FIELDS: [&str; 2] = ["workerId", "lastAnnotator"];

/// Arrays of per-period records, one entry per revision.
pub const NESTED_ARRAYS: [&str; 1] = ["history"];

/// Top-level email fields, matched via their `.keyword` sub-field.
pub const EMAIL_FIELDS: [&str; 6] = [
    "email",
    "email_address",
    "worker_email",
    "workerEmail",
    "lastAnnotatorEmail",
    "qa_checker_email",
];

/// Email fields inside the nested objects.
pub const NESTED_EMAIL_FIELDS: [&str; 3] =
    ["workerEmail", "lastAnnotatorEmail", "lastReviewerEmail"];

/// Email fields inside history entries.
const ARRAY_EMAIL_FIELDS: [&str; 3] = ["email", "workerEmail", "lastAnnotatorEmail"];

/// Identifier masking script. Field lists come in through params; values may
/// be plain or " | "-delimited lists, and only exact tokens are replaced.
/// History arrays are rebuilt entry by entry. Sets `ctx.op` to `noop` when
/// nothing changed so a replay leaves the document version alone.
const ID_SCRIPT: &str = r#"
String maskTokens(String original, String target, String rep) {
    if (original.contains(' | ')) {
        String[] parts = original.split(' \\| ');
        for (int i = 0; i < parts.length; i++) {
            if (parts[i].trim().equals(target)) { parts[i] = rep; }
        }
        return String.join(' | ', parts);
    }
    if (original.equals(target)) { return rep; }
    return original;
}

boolean changed = false;

for (String f : params.idFields) {
    if (ctx._source.containsKey(f) && ctx._source[f] != null) {
        String original = ctx._source[f].toString();
        String masked = maskTokens(original, params.subject, params.mask);
        if (!original.equals(masked)) { ctx._source[f] = masked; changed = true; }
    }
}

for (String obj : params.nestedObjects) {
    if (ctx._source.containsKey(obj) && ctx._source[obj] != null) {
        for (String f : params.nestedIdFields) {
            if (ctx._source[obj].containsKey(f) && ctx._source[obj][f] != null) {
                String original = ctx._source[obj][f].toString();
                String masked = maskTokens(original, params.subject, params.mask);
                if (!original.equals(masked)) { ctx._source[obj][f] = masked; changed = true; }
            }
        }
    }
}

for (String arr : params.nestedArrays) {
    if (ctx._source.containsKey(arr) && ctx._source[arr] instanceof List) {
        def rebuilt = new ArrayList();
        for (def entry : ctx._source[arr]) {
            if (entry != null) {
                for (String f : params.nestedIdFields) {
                    if (entry.containsKey(f) && entry[f] != null) {
                        String original = entry[f].toString();
                        String masked = maskTokens(original, params.subject, params.mask);
                        if (!original.equals(masked)) { entry[f] = masked; changed = true; }
                    }
                }
            }
            rebuilt.add(entry);
        }
        ctx._source[arr] = rebuilt;
    }
}

if (!changed) { ctx.op = 'noop'; }
"#;

/// Email masking script; same structure as the identifier script over the
/// email field lists.
const EMAIL_SCRIPT: &str = r#"
String maskTokens(String original, String target, String rep) {
    if (original.contains(' | ')) {
        String[] parts = original.split(' \\| ');
        for (int i = 0; i < parts.length; i++) {
            if (parts[i].trim().equals(target)) { parts[i] = rep; }
        }
        return String.join(' | ', parts);
    }
    if (original.equals(target)) { return rep; }
    return original;
}

boolean changed = false;

for (String f : params.emailFields) {
    if (ctx._source.containsKey(f) && ctx._source[f] != null) {
        String original = ctx._source[f].toString();
        String masked = maskTokens(original, params.subject, params.mask);
        if (!original.equals(masked)) { ctx._source[f] = masked; changed = true; }
    }
}

for (String obj : params.nestedObjects) {
    if (ctx._source.containsKey(obj) && ctx._source[obj] != null) {
        for (String f : params.nestedEmailFields) {
            if (ctx._source[obj].containsKey(f) && ctx._source[obj][f] != null) {
                String original = ctx._source[obj][f].toString();
                String masked = maskTokens(original, params.subject, params.mask);
                if (!original.equals(masked)) { ctx._source[obj][f] = masked; changed = true; }
            }
        }
    }
}

for (String arr : params.nestedArrays) {
    if (ctx._source.containsKey(arr) && ctx._source[arr] instanceof List) {
        def rebuilt = new ArrayList();
        for (def entry : ctx._source[arr]) {
            if (entry != null) {
                for (String f : params.arrayEmailFields) {
                    if (entry.containsKey(f) && entry[f] != null) {
                        String original = entry[f].toString();
                        String masked = maskTokens(original, params.subject, params.mask);
                        if (!original.equals(masked)) { entry[f] = masked; changed = true; }
                    }
                }
            }
            rebuilt.add(entry);
        }
        ctx._source[arr] = rebuilt;
    }
}

if (!changed) { ctx.op = 'noop'; }
"#;

fn id_clauses(subject_id: &str) -> Vec<Value> {
    let mut should: Vec<Value> = ID_FIELDS
        .iter()
        .map(|f| json!({ "term": { (*f): subject_id } }))
        .collect();
    for obj in NESTED_OBJECTS {
        should.push(json!({ "term": { (format!("{obj}.workerId")): subject_id } }));
    }
    should.push(json!({ "term": { "history.workerId": subject_id } }));
    should
}

fn email_clauses(email: &str) -> Vec<Value> {
    let mut should: Vec<Value> = EMAIL_FIELDS
        .iter()
        .map(|f| json!({ "term": { (format!("{f}.keyword")): email } }))
        .collect();
    for obj in NESTED_OBJECTS {
        for f in NESTED_EMAIL_FIELDS {
            should.push(json!({ "term": { (format!("{obj}.{f}.keyword")): email } }));
        }
    }
    for f in ["workerEmail", "lastAnnotatorEmail"] {
        should.push(json!({ "term": { (format!("history.{f}.keyword")): email } }));
    }
    should
}

fn bool_query(should: Vec<Value>) -> Value {
    json!({ "bool": { "should": should, "minimum_should_match": 1 } })
}

/// `_update_by_query` body for the identifier field group.
pub fn id_update_spec(subject_id: &str) -> Value {
    json!({
        "query": bool_query(id_clauses(subject_id)),
        "script": {
            "lang": "painless",
            "source": ID_SCRIPT,
            "params": {
                "subject": subject_id,
                "mask": ID_SENTINEL,
                "idFields": ID_FIELDS,
                "nestedObjects": NESTED_OBJECTS,
                "nestedIdFields": NESTED_ID_FIELDS,
                "nestedArrays": NESTED_ARRAYS
            }
        }
    })
}

/// `_update_by_query` body for the email field group.
pub fn email_update_spec(email: &str) -> Value {
    json!({
        "query": bool_query(email_clauses(email)),
        "script": {
            "lang": "painless",
            "source": EMAIL_SCRIPT,
            "params": {
                "subject": email,
                "mask": EMAIL_SENTINEL,
                "emailFields": EMAIL_FIELDS,
                "nestedObjects": NESTED_OBJECTS,
                "nestedEmailFields": NESTED_EMAIL_FIELDS,
                "nestedArrays": NESTED_ARRAYS,
                "arrayEmailFields": ARRAY_EMAIL_FIELDS
            }
        }
    })
}

/// The update spec for one field group.
pub fn update_spec(group: FieldGroup, subject_id: &str, email: &str) -> Value {
    match group {
        FieldGroup::Identifier => id_update_spec(subject_id),
        FieldGroup::Email => email_update_spec(email),
    }
}

/// One-hit probe used by discovery to test whether a partition holds any
/// trace of the subject.
pub fn probe_query(subject_id: &str, email: &str) -> Value {
    let mut should = id_clauses(subject_id);
    should.append(&mut email_clauses(email));
    json!({ "size": 1, "query": bool_query(should) })
}

/// Post-sweep residual query; asks for a small document sample for the log.
pub fn verification_query(subject_id: &str, email: &str, sample: usize) -> Value {
    let mut spec = probe_query(subject_id, email);
    spec["size"] = json!(sample);
    spec
}

fn value_matches(value: &Value, target: &str) -> bool {
    value
        .as_str()
        .is_some_and(|s| s == target || s.split(" | ").any(|token| token.trim() == target))
}

/// Names the fields of a hit's `_source` that still carry the subject, for
/// residual reporting.
pub fn offending_fields(source: &Value, subject_id: &str, email: &str) -> Vec<String> {
    let mut out = Vec::new();
    for f in ID_FIELDS {
        if value_matches(&source[f], subject_id) {
            out.push(f.to_string());
        }
    }
    for f in EMAIL_FIELDS {
        if value_matches(&source[f], email) {
            out.push(f.to_string());
        }
    }
    for obj in NESTED_OBJECTS {
        for f in NESTED_ID_FIELDS {
            if value_matches(&source[obj][f], subject_id) {
                out.push(format!("{obj}.{f}"));
            }
        }
        for f in NESTED_EMAIL_FIELDS {
            if value_matches(&source[obj][f], email) {
                out.push(format!("{obj}.{f}"));
            }
        }
    }
    for arr in NESTED_ARRAYS {
        let Some(entries) = source[arr].as_array() else {
            continue;
        };
        for f in NESTED_ID_FIELDS {
            if entries.iter().any(|e| value_matches(&e[f], subject_id)) {
                out.push(format!("{arr}.{f}"));
            }
        }
        for f in ARRAY_EMAIL_FIELDS {
            if entries.iter().any(|e| value_matches(&e[f], email)) {
                out.push(format!("{arr}.{f}"));
            }
        }
    }
    out
}
