//! CSV ↔ raw records. Callers read and write the bytes; nothing here touches the filesystem.

use crate::config::{LinkConfig, SourceConfig};
use crate::error::LinkError;
use crate::model::RawRecord;

/// Parse one source's CSV into raw records, looking columns up by header.
pub fn load_csv_records(
    source_name: &str,
    csv_data: &str,
    source: &SourceConfig,
    config: &LinkConfig,
) -> Result<Vec<RawRecord>, LinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| LinkError::Io(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let idx = |name: &str| -> Result<usize, LinkError> {
        headers.iter().position(|h| h == name).ok_or_else(|| LinkError::MissingColumn {
            source: source_name.into(),
            column: name.into(),
        })
    };

    let id_idx = idx(&source.id_column)?;
    let field_idx: Vec<(String, usize)> = config
        .fields
        .iter()
        .map(|f| -> Result<(String, usize), LinkError> {
            Ok((f.name.clone(), idx(source.column_for(&f.name))?))
        })
        .collect::<Result<_, _>>()?;

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| LinkError::Io(e.to_string()))?;
        let id = record.get(id_idx).unwrap_or("").trim().to_string();
        let fields = field_idx
            .iter()
            .map(|(name, i)| (name.clone(), record.get(*i).unwrap_or("").to_string()));
        records.push(RawRecord::new(id, fields));
    }

    log::info!("source '{source_name}': loaded {} record(s)", records.len());
    Ok(records)
}

/// Ground-truth links from a CSV with `id_a` and `id_b` columns.
pub fn load_truth(csv_data: &str) -> Result<Vec<(String, String)>, LinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(csv_data.as_bytes());
    let headers = reader.headers().map_err(|e| LinkError::Io(e.to_string()))?.clone();
    let idx = |name: &str| {
        headers.iter().position(|h| h.trim() == name).ok_or_else(|| LinkError::MissingColumn {
            source: "truth".into(),
            column: name.into(),
        })
    };
    let (a_idx, b_idx) = (idx("id_a")?, idx("id_b")?);

    let mut links = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| LinkError::Io(e.to_string()))?;
        let a = record.get(a_idx).unwrap_or("").trim().to_string();
        let b = record.get(b_idx).unwrap_or("").trim().to_string();
        links.push((a, b));
    }
    Ok(links)
}

/// Serialize raw records as CSV: id column first, then `columns` in order.
pub fn records_to_csv(id_column: &str, columns: &[&str], records: &[RawRecord]) -> Result<String, LinkError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let io = |e: csv::Error| LinkError::Io(e.to_string());

    let mut header = vec![id_column];
    header.extend_from_slice(columns);
    writer.write_record(&header).map_err(io)?;

    for record in records {
        let mut row = vec![record.id.as_str()];
        row.extend(columns.iter().map(|c| record.fields.get(*c).map(String::as_str).unwrap_or("")));
        writer.write_record(&row).map_err(io)?;
    }
    into_string(writer)
}

pub fn truth_to_csv(links: &[(String, String)]) -> Result<String, LinkError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let io = |e: csv::Error| LinkError::Io(e.to_string());
    writer.write_record(["id_a", "id_b"]).map_err(io)?;
    for (a, b) in links {
        writer.write_record([a, b]).map_err(io)?;
    }
    into_string(writer)
}

fn into_string(writer: csv::Writer<Vec<u8>>) -> Result<String, LinkError> {
    let bytes = writer.into_inner().map_err(|e| LinkError::Io(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| LinkError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
name = "t"

[sources.a]
file = "a.csv"

[sources.b]
file = "b.csv"
id_column = "person_id"

[sources.b.columns]
lastname = "surname"

[[fields]]
name = "firstname"
type = "string"
metric = { kind = "jaro_winkler" }

[[fields]]
name = "lastname"
type = "string"
metric = { kind = "jaro_winkler" }
"#;

    fn config() -> LinkConfig {
        LinkConfig::from_toml(CONFIG).unwrap()
    }

    #[test]
    fn load_with_renamed_columns() {
        let cfg = config();
        let sources = cfg.sources.clone().unwrap();
        let data = "person_id,firstname,surname,extra\n7,Ada,Lovelace,x\n8,Grace,\"Hopper, Jr\",y\n";
        let records = load_csv_records("b", data, &sources.b, &cfg).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "7");
        assert_eq!(records[0].fields["lastname"], "Lovelace");
        assert_eq!(records[1].fields["lastname"], "Hopper, Jr");
        assert!(!records[0].fields.contains_key("extra"));
    }

    #[test]
    fn missing_column_is_reported() {
        let cfg = config();
        let sources = cfg.sources.clone().unwrap();
        let err = load_csv_records("a", "id,firstname\n1,Ada\n", &sources.a, &cfg).unwrap_err();
        match err {
            LinkError::MissingColumn { source, column } => {
                assert_eq!(source, "a");
                assert_eq!(column, "lastname");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truth_round_trip() {
        let links = vec![("1".to_string(), "9".to_string()), ("2".to_string(), "8".to_string())];
        let csv = truth_to_csv(&links).unwrap();
        assert!(csv.starts_with("id_a,id_b\n"));
        assert_eq!(load_truth(&csv).unwrap(), links);
        assert!(matches!(load_truth("a,b\n1,2\n"), Err(LinkError::MissingColumn { .. })));
    }

    #[test]
    fn records_to_csv_writes_columns_in_order() {
        let records = vec![RawRecord::new("1", [("lastname", "Smith"), ("firstname", "John")])];
        let csv = records_to_csv("id", &["firstname", "lastname"], &records).unwrap();
        assert_eq!(csv, "id,firstname,lastname\n1,John,Smith\n");
    }
}
