//! Parses the JSON schema descriptor that accompanies a vendor TSV dump:
//! `{"resources": [{"schema": {"fields": [{"name", "index", "type"}, ...]}}]}`,
//! following the reference importer's "datapackage" descriptor shape.

use serde::Deserialize;
use std::path::Path;

use crate::errors::{Error, ParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Date,
    Integer,
    Number,
    Array,
}

impl FieldType {
    fn from_descriptor(raw: &str) -> Self {
        match raw {
            "date" | "datetime" => FieldType::Date,
            "integer" => FieldType::Integer,
            "number" | "float" => FieldType::Number,
            "array" => FieldType::Array,
            // unknown declared types fall back to string.
            _ => FieldType::String,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub index: usize,
    pub kind: FieldType,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    resources: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    schema: Schema,
}

#[derive(Debug, Deserialize)]
struct Schema {
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: String,
    index: usize,
    #[serde(rename = "type")]
    kind: String,
}

/// Reads and parses a schema descriptor file, returning its fields ordered
/// by declared index.
pub fn load(path: &Path) -> Result<Vec<Field>, Error> {
    let text = std::fs::read_to_string(path)?;
    let descriptor: Descriptor = serde_json::from_str(&text)?;

    let resource = descriptor
        .resources
        .first()
        .ok_or_else(|| Error::Parsing(ParseError::Schema("descriptor has no resources".into())))?;

    let mut fields: Vec<Field> = resource
        .schema
        .fields
        .iter()
        .map(|raw| Field { name: raw.name.clone(), index: raw.index, kind: FieldType::from_descriptor(&raw.kind) })
        .collect();
    fields.sort_by_key(|f| f.index);
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_falls_back_to_string() {
        assert_eq!(FieldType::from_descriptor("geojson"), FieldType::String);
    }

    #[test]
    fn parses_minimal_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        std::fs::write(
            &path,
            r#"{"resources":[{"schema":{"fields":[
                {"name":"specimenid","index":0,"type":"integer"},
                {"name":"nuc","index":1,"type":"string"},
                {"name":"coord","index":2,"type":"array"}
            ]}}]}"#,
        )
        .unwrap();

        let fields = load(&path).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].name, "specimenid");
        assert_eq!(fields[0].kind, FieldType::Integer);
        assert_eq!(fields[2].kind, FieldType::Array);
    }
}
