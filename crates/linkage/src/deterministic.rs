//! Deterministic baseline: an inner join of A and B on exact equality of
//! every listed field. Records with a missing join field never join.

use std::collections::HashMap;

use crate::model::Record;

const KEY_SEPARATOR: char = '\u{1f}';

/// Join key of a record, or `None` if any join field is missing.
pub fn join_key(record: &Record, fields: &[&str]) -> Option<String> {
    let mut key = String::new();
    for (i, field) in fields.iter().enumerate() {
        let value = record.value(field);
        if value.is_missing() {
            return None;
        }
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&value.render());
    }
    Some(key)
}

/// Every `(a_id, b_id)` pair whose join fields are all equal, sorted by ids.
pub fn exact_join(a: &[Record], b: &[Record], fields: &[&str]) -> Vec<(String, String)> {
    let mut index: HashMap<String, Vec<&str>> = HashMap::new();
    for record in b {
        if let Some(key) = join_key(record, fields) {
            index.entry(key).or_default().push(record.id());
        }
    }

    let mut pairs: Vec<(String, String)> = a
        .iter()
        .filter_map(|record| join_key(record, fields).map(|key| (record, key)))
        .flat_map(|(record, key)| {
            index
                .get(&key)
                .into_iter()
                .flatten()
                .map(move |b_id| (record.id().to_string(), b_id.to_string()))
        })
        .collect();
    pairs.sort();

    log::info!("exact join on {} field(s): {} pair(s)", fields.len(), pairs.len());
    pairs
}
