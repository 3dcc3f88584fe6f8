//! The external name-resolution service boundary. Modeled as a trait so the
//! real HTTP-backed resolver and a scripted test double both satisfy the
//! harmoniser's worker pool.

use serde::Deserialize;

use crate::errors::RemoteError;

/// How confidently the service matched a query string to a canonical taxon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchType {
    None,
    Fuzzy,
    Exact,
    #[serde(rename = "HIGHERRANK")]
    HigherRank,
}

/// One query object: a distinct lineage tuple at a given rank, plus every
/// specimen sharing it.
#[derive(Debug, Clone)]
pub struct NameQuery {
    pub query_string: String,
    pub query_rank: String,
    pub specimen_ids: Vec<i64>,
}

/// The service's response to a single name query, already deserialised from
/// whatever wire format the real backend uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NameMatch {
    #[serde(default)]
    pub match_type: Option<MatchType>,
    #[serde(default)]
    pub confidence: Option<i32>,
    /// Whether the response itself flagged a higher-rank match (in addition
    /// to `match_type == HigherRank`).
    #[serde(default)]
    pub higher_rank_status: bool,
    /// The rank name the response actually matched at (e.g. "genus", or an
    /// out-of-enum name like "form").
    #[serde(default)]
    pub match_rank: Option<String>,
    /// Canonical lineage names present in the response, keyed by rank name.
    #[serde(default)]
    pub lineage: std::collections::BTreeMap<String, String>,
    /// The external system's stable taxon identifier (`usageKey`).
    #[serde(default)]
    pub taxon_key: Option<i64>,
}

pub trait NameResolver: Send + Sync {
    fn resolve(&self, query: &NameQuery) -> Result<NameMatch, RemoteError>;
}
