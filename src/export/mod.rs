//! Export formatters: read-only projections of `SELECTED` records into
//! FASTA, classifier-ready FASTA, and tabular (TSV/CSV) shapes. FASTA here
//! walks the same six ranks as the classifier bridge's header but without
//! the `INCL_*` gating — every non-null rank value is included regardless of
//! whether the harmoniser ever confirmed it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::classify::tax_names;
use crate::errors::Error;
use crate::store::models::Specimen;
use crate::store::Store;

const TABLE_HEADER: [&str; 9] =
    ["checks", "specimen_id", "nuc_san", "phylum", "class", "order", "family", "genus", "species"];

fn ungated_tax_names(specimen: &Specimen) -> Vec<String> {
    [
        specimen.taxon_phylum.as_deref(),
        specimen.taxon_class.as_deref(),
        specimen.taxon_order.as_deref(),
        specimen.taxon_family.as_deref(),
        specimen.taxon_genus.as_deref(),
        specimen.taxon_species.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(|name| name.replace(' ', "_"))
    .collect()
}

fn is_clean_sequence(nuc_san: &str) -> bool {
    !nuc_san.is_empty() && nuc_san.chars().all(|c| matches!(c, 'A' | 'C' | 'G' | 'T'))
}

/// Writes every `SELECTED` record as a FASTA entry. `gated` selects between
/// the ungated export format and the classifier bridge's `INCL_*`-gated
/// header (used by the standalone `export classifier` command). Returns the
/// number of records written.
pub fn export_fasta(store: &Store, path: &Path, gated: bool) -> Result<usize, Error> {
    let selected = store.selected()?;
    let mut writer = BufWriter::new(File::create(path)?);

    let mut count = 0;
    for specimen in &selected {
        let Some(nuc_san) = specimen.nuc_san.as_deref() else { continue };
        if !is_clean_sequence(nuc_san) {
            continue;
        }
        let tax = if gated { tax_names(specimen) } else { ungated_tax_names(specimen) };
        writeln!(writer, ">{};tax={};", specimen.specimen_id, tax.join(","))?;
        writeln!(writer, "{nuc_san}")?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

/// Writes every `SELECTED` record as one delimited table row, using the
/// fixed column order `[checks, specimen_id, nuc_san, phylum, class, order,
/// family, genus, species]`.
pub fn export_table(store: &Store, path: &Path, delimiter: u8) -> Result<usize, Error> {
    let selected = store.selected()?;
    let mut writer = csv::WriterBuilder::new().delimiter(delimiter).from_path(path)?;
    writer.write_record(TABLE_HEADER)?;

    let mut count = 0;
    for specimen in &selected {
        writer.write_record([
            specimen.checks.to_string(),
            specimen.specimen_id.to_string(),
            specimen.nuc_san.clone().unwrap_or_default(),
            specimen.taxon_phylum.clone().unwrap_or_default(),
            specimen.taxon_class.clone().unwrap_or_default(),
            specimen.taxon_order.clone().unwrap_or_default(),
            specimen.taxon_family.clone().unwrap_or_default(),
            specimen.taxon_genus.clone().unwrap_or_default(),
            specimen.taxon_species.clone().unwrap_or_default(),
        ])?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specimen() -> Specimen {
        Specimen {
            specimen_id: 7,
            nuc_raw: "ACGT".into(),
            nuc_san: Some("ACGT".into()),
            hash: "h".into(),
            last_updated: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            review: false,
            include: true,
            taxon_key: Some(1),
            taxon_kingdom: Some("Plantae".into()),
            taxon_phylum: Some("Tracheophyta".into()),
            taxon_class: None,
            taxon_order: None,
            taxon_family: None,
            taxon_subfamily: None,
            taxon_tribe: None,
            taxon_genus: Some("Quercus".into()),
            taxon_species: Some("Quercus robur".into()),
            taxon_subspecies: None,
            identification_rank: None,
            country_iso: None,
            lat: None,
            lon: None,
            kg_zone: None,
            checks: crate::bitvector::INCL_PHYLUM as i64,
            geo_info: None,
            processing_info: None,
        }
    }

    #[test]
    fn ungated_tax_names_skips_nulls_but_ignores_incl_bits() {
        let s = specimen();
        assert_eq!(ungated_tax_names(&s), vec!["Tracheophyta", "Quercus", "Quercus_robur"]);
    }
}
