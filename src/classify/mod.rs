//! Classifier bridge: exports reference/query FASTA files for the external
//! `raxtax` classifier, invokes it, and marks specimens whose claimed
//! lineage the classifier disagrees with above threshold.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::bitvector::{self, BAD_CLASSIFICATION};
use crate::errors::Error;
use crate::store::models::Specimen;
use crate::store::Store;

/// The six ranks a FASTA tax-string walks, shallowest to deepest.
const FASTA_RANKS: [(fn(&Specimen) -> Option<&str>, u64); 6] = [
    (|s| s.taxon_phylum.as_deref(), bitvector::INCL_PHYLUM),
    (|s| s.taxon_class.as_deref(), bitvector::INCL_CLASS),
    (|s| s.taxon_order.as_deref(), bitvector::INCL_ORDER),
    (|s| s.taxon_family.as_deref(), bitvector::INCL_FAMILY),
    (|s| s.taxon_genus.as_deref(), bitvector::INCL_GENUS),
    (|s| s.taxon_species.as_deref(), bitvector::INCL_SPECIES),
];

/// The external classifier binary's name on `PATH`.
pub const CLASSIFIER_BIN: &str = "raxtax";

/// Walks [`FASTA_RANKS`] shallow-to-deep, including a rank's name only if its
/// `INCL_*` bit is set *and* every shallower rank was already included (the
/// monotone-prefix rule); stops at the first gap.
pub fn tax_names(specimen: &Specimen) -> Vec<String> {
    let checks = specimen.checks as u64;
    let mut names = Vec::with_capacity(FASTA_RANKS.len());
    for (getter, bit) in FASTA_RANKS {
        if checks & bit != bit {
            break;
        }
        match getter(specimen) {
            Some(name) => names.push(name.replace(' ', "_")),
            None => break,
        }
    }
    names
}

fn is_clean_sequence(nuc_san: &str) -> bool {
    !nuc_san.is_empty() && nuc_san.chars().all(|c| matches!(c, 'A' | 'C' | 'G' | 'T'))
}

/// Builds one FASTA record (two lines, no trailing blank line) for
/// `specimen`, or `None` if it has no sanitised sequence or that sequence
/// contains characters outside `{A, C, G, T}`.
fn fasta_record(specimen: &Specimen) -> Option<String> {
    let nuc_san = specimen.nuc_san.as_deref()?;
    if !is_clean_sequence(nuc_san) {
        return None;
    }
    let tax = tax_names(specimen).join(",");
    Some(format!(">{};tax={};\n{}", specimen.specimen_id, tax, nuc_san))
}

/// Writes the reference FASTA (every `SELECTED` record) and the query FASTA
/// (the subset of those also under `review`). Returns `(reference_count,
/// query_count)`.
pub fn export_fasta_for_classifier(
    store: &Store,
    reference_path: &Path,
    query_path: &Path,
) -> Result<(usize, usize), Error> {
    let selected = store.selected()?;
    let mut reference_writer = BufWriter::new(File::create(reference_path)?);
    let mut query_writer = BufWriter::new(File::create(query_path)?);

    let mut reference_count = 0;
    let mut query_count = 0;
    for specimen in &selected {
        let Some(record) = fasta_record(specimen) else { continue };
        writeln!(reference_writer, "{record}")?;
        reference_count += 1;
        if specimen.review {
            writeln!(query_writer, "{record}")?;
            query_count += 1;
        }
    }
    reference_writer.flush()?;
    query_writer.flush()?;
    Ok((reference_count, query_count))
}

/// Spawns `raxtax -d <db_fasta> -i <query_fasta> --skip-exact-matches
/// --redo` in `out_dir`, returning the path to its output TSV.
pub fn invoke_classifier(db_fasta: &Path, query_fasta: &Path, out_dir: &Path) -> Result<PathBuf, Error> {
    let status = std::process::Command::new(CLASSIFIER_BIN)
        .arg("-d")
        .arg(db_fasta)
        .arg("-i")
        .arg(query_fasta)
        .arg("--skip-exact-matches")
        .arg("--redo")
        .current_dir(out_dir)
        .status()
        .map_err(|err| Error::Classifier(format!("failed to spawn {CLASSIFIER_BIN}: {err}")))?;

    if !status.success() {
        return Err(Error::Classifier(format!("{CLASSIFIER_BIN} exited with {status}")));
    }

    let out_file = out_dir.join("raxtax.out.tsv");
    if !out_file.exists() {
        return Err(Error::Classifier(format!("missing classifier output at {}", out_file.display())));
    }
    Ok(out_file)
}

/// True iff any rank before the last scored position disagrees between
/// `original` and `compared` with a score `>= 0.9`. Mirrors
/// `RaxTaxer::_mark_entry` (species-level, the last scored rank, is never
/// grounds for a mismatch on its own).
fn is_bad_classification(original: &[&str], compared: &[&str], scores: &[f64]) -> bool {
    let limit = scores.len().saturating_sub(1);
    let pairs = original.len().min(compared.len()).min(limit);
    for i in 0..pairs {
        if original[i] != compared[i] {
            if let Some(&score) = scores.get(i) {
                if score >= 0.9 {
                    return true;
                }
            }
        }
    }
    false
}

/// Parses one classifier output line into `(specimen_id, original, compared,
/// scores)`, or `None` if the line doesn't match the expected shape.
fn parse_output_line(col0: &str, col1: &str, col2: &str) -> Option<(i64, Vec<String>, Vec<String>, Vec<f64>)> {
    let mut eq_parts = col0.splitn(2, '=');
    let id_part = eq_parts.next()?;
    let tax_part = eq_parts.next()?;

    let specimen_id: i64 = id_part.split(';').next()?.trim().parse().ok()?;
    let original: Vec<String> = tax_part.trim_end_matches(';').split(',').map(str::to_string).collect();
    let compared: Vec<String> = col1.split(',').map(str::to_string).collect();
    let scores: Vec<f64> = col2.split(',').filter_map(|s| s.trim().parse().ok()).collect();

    Some((specimen_id, original, compared, scores))
}

/// Reads the classifier's TSV output, keeping only the first line per
/// `specimen_id`, and returns the ids judged to be bad classifications.
pub fn parse_classifier_output(path: &Path) -> Result<Vec<i64>, Error> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').has_headers(false).flexible(true).from_path(path)?;
    let mut seen = std::collections::HashSet::new();
    let mut marked = Vec::new();

    for record in reader.records() {
        let record = record?;
        let (Some(col0), Some(col1), Some(col2)) = (record.get(0), record.get(1), record.get(2)) else { continue };
        let Some((specimen_id, original, compared, scores)) = parse_output_line(col0, col1, col2) else { continue };
        if !seen.insert(specimen_id) {
            continue;
        }

        let original_refs: Vec<&str> = original.iter().map(String::as_str).collect();
        let compared_refs: Vec<&str> = compared.iter().map(String::as_str).collect();
        if is_bad_classification(&original_refs, &compared_refs, &scores) {
            marked.push(specimen_id);
        }
    }
    Ok(marked)
}

/// Exports the reference/query FASTA pair into `workdir`, invokes the
/// classifier, and ORs [`BAD_CLASSIFICATION`] into every specimen it flags.
/// Returns the number of specimens marked.
pub fn run_classifier_bridge(store: &Store, workdir: &Path) -> Result<usize, Error> {
    std::fs::create_dir_all(workdir)?;
    let reference_path = workdir.join("reference.fasta");
    let query_path = workdir.join("query.fasta");

    let (reference_count, query_count) = export_fasta_for_classifier(store, &reference_path, &query_path)?;
    tracing::info!(reference_count, query_count, "exported classifier FASTA");
    if query_count == 0 {
        return Ok(0);
    }

    let out_file = invoke_classifier(&reference_path, &query_path, workdir)?;
    let marked = parse_classifier_output(&out_file)?;

    let updates: Vec<(i64, u64)> = marked.iter().map(|&id| (id, BAD_CLASSIFICATION)).collect();
    store.or_checks(&updates)?;
    Ok(marked.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specimen(checks: u64) -> Specimen {
        Specimen {
            specimen_id: 1,
            nuc_raw: "ACGT".into(),
            nuc_san: Some("ACGT".into()),
            hash: "h".into(),
            last_updated: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            review: true,
            include: false,
            taxon_key: Some(1),
            taxon_kingdom: Some("Plantae".into()),
            taxon_phylum: Some("Tracheophyta".into()),
            taxon_class: Some("Magnoliopsida".into()),
            taxon_order: Some("Fagales".into()),
            taxon_family: Some("Fagaceae".into()),
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
            checks: checks as i64,
            geo_info: None,
            processing_info: None,
        }
    }

    #[test]
    fn tax_names_stops_at_first_gated_rank() {
        let s = specimen(bitvector::INCL_PHYLUM | bitvector::INCL_CLASS);
        assert_eq!(tax_names(&s), vec!["Tracheophyta", "Magnoliopsida"]);
    }

    #[test]
    fn tax_names_replaces_spaces_with_underscores() {
        let all = bitvector::INCL_PHYLUM
            | bitvector::INCL_CLASS
            | bitvector::INCL_ORDER
            | bitvector::INCL_FAMILY
            | bitvector::INCL_GENUS
            | bitvector::INCL_SPECIES;
        let s = specimen(all);
        assert_eq!(tax_names(&s).last().unwrap(), "Quercus_robur");
    }

    #[test]
    fn fasta_record_skips_non_acgt_sequences() {
        let mut s = specimen(bitvector::INCL_PHYLUM);
        s.nuc_san = Some("ACGTN".into());
        assert!(fasta_record(&s).is_none());
    }

    #[test]
    fn fasta_record_skips_records_with_no_sanitised_sequence() {
        let mut s = specimen(bitvector::INCL_PHYLUM);
        s.nuc_san = None;
        assert!(fasta_record(&s).is_none());
    }

    #[test]
    fn bad_classification_requires_high_score_mismatch_before_species() {
        let original = vec!["Tracheophyta", "Magnoliopsida", "Fagales", "Fagaceae", "Quercus", "Quercus_robur"];
        let compared = vec!["Tracheophyta", "Magnoliopsida", "Fagales", "Fagaceae", "Juglans", "Juglans_regia"];
        let scores = vec![1.0, 1.0, 1.0, 1.0, 0.95, 0.2];
        assert!(is_bad_classification(&original, &compared, &scores));
    }

    #[test]
    fn species_level_mismatch_alone_is_not_bad_classification() {
        let original = vec!["Tracheophyta", "Magnoliopsida", "Fagales", "Fagaceae", "Quercus", "Quercus_robur"];
        let compared = vec!["Tracheophyta", "Magnoliopsida", "Fagales", "Fagaceae", "Quercus", "Quercus_alba"];
        let scores = vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.99];
        assert!(!is_bad_classification(&original, &compared, &scores));
    }

    #[test]
    fn parse_output_line_extracts_id_and_lists() {
        let (id, original, compared, scores) =
            parse_output_line("42;tax=Tracheophyta,Quercus_robur;", "Tracheophyta,Quercus_robur", "1.0,0.8").unwrap();
        assert_eq!(id, 42);
        assert_eq!(original, vec!["Tracheophyta", "Quercus_robur"]);
        assert_eq!(compared, vec!["Tracheophyta", "Quercus_robur"]);
        assert_eq!(scores, vec![1.0, 0.8]);
    }
}
