//! The ingest-staging table (`processing_input`): schema-driven at runtime
//! from the accompanying JSON descriptor, so it cannot be a compile-time
//! `diesel::table!` like `specimen`. Addressed through raw SQL, following the
//! dynamic `CREATE TABLE`/`INSERT` pattern of the reference importer this
//! system's ingest pipeline is modelled on.
//!
//! Values are inlined as escaped SQL literals rather than bound parameters:
//! the column count and types vary per schema descriptor at runtime, which
//! diesel's statically-typed bind chain (`sql_query(..).bind::<T, _>(..)`)
//! cannot represent for an a-priori-unknown number of columns.

use diesel::connection::SimpleConnection;

use crate::errors::Error;
use crate::ingest::schema_descriptor::{Field, FieldType};
use crate::ingest::Cell;
use crate::store::SqliteConn;

/// Builds the `CREATE TABLE processing_input (...)` statement for the given
/// field list, ordered by each field's declared index.
pub fn create_table_sql(fields: &[Field]) -> String {
    let mut ordered = fields.to_vec();
    ordered.sort_by_key(|f| f.index);

    let columns: Vec<String> = ordered
        .iter()
        .map(|field| {
            let sql_type = match field.kind {
                FieldType::Integer => "BIGINT",
                FieldType::Number => "DOUBLE",
                FieldType::Date => "DATE",
                FieldType::String | FieldType::Array => "TEXT",
            };
            let not_null = if field.name == "specimenid" || field.name == "nuc" { " NOT NULL" } else { "" };
            format!("{} {}{}", quote(&field.name), sql_type, not_null)
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS processing_input ({}, PRIMARY KEY({}))",
        columns.join(", "),
        quote("specimenid")
    )
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Escapes a value for inlining as a single-quoted SQL string literal.
fn sql_escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn cell_literal(cell: &Cell) -> String {
    match cell {
        Cell::Null => "NULL".to_string(),
        Cell::Str(s) => format!("'{}'", sql_escape(s)),
        Cell::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        Cell::Int(i) => i.to_string(),
        Cell::Num(n) => n.to_string(),
        Cell::Array(items) => format!("'{}'", sql_escape(&items.join(","))),
    }
}

pub fn ensure_table(conn: &mut SqliteConn, fields: &[Field]) -> Result<(), Error> {
    conn.batch_execute(&create_table_sql(fields))?;
    Ok(())
}

/// Inserts one staging row. `fields` gives column order; `cells` is the
/// row's parsed values in the same order.
pub fn insert_row(conn: &mut SqliteConn, fields: &[Field], cells: &[Cell]) -> Result<(), Error> {
    let mut ordered: Vec<(&Field, &Cell)> = fields.iter().zip(cells.iter()).collect();
    ordered.sort_by_key(|(f, _)| f.index);

    let columns: Vec<String> = ordered.iter().map(|(f, _)| quote(&f.name)).collect();
    let values: Vec<String> = ordered.iter().map(|(_, cell)| cell_literal(cell)).collect();
    let sql = format!(
        "INSERT OR REPLACE INTO processing_input ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    );
    conn.batch_execute(&sql)?;
    Ok(())
}
