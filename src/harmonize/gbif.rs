//! `GbifResolver`: a [`NameResolver`](super::client::NameResolver)
//! implementation backed by the real external name-resolution service's
//! species-match endpoint.

use serde::Deserialize;

use super::client::{MatchType, NameMatch, NameQuery, NameResolver};
use crate::errors::RemoteError;

const MATCH_ENDPOINT: &str = "https://api.gbif.org/v1/species/match";

pub struct GbifResolver {
    agent: ureq::Agent,
    base_url: String,
}

impl GbifResolver {
    pub fn new() -> Self {
        Self { agent: ureq::agent(), base_url: MATCH_ENDPOINT.to_string() }
    }

    #[cfg(test)]
    fn with_base_url(base_url: String) -> Self {
        Self { agent: ureq::agent(), base_url }
    }
}

impl Default for GbifResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw wire shape of the species-match response; mapped into the
/// resolver-agnostic [`NameMatch`].
#[derive(Debug, Deserialize)]
struct RawMatch {
    #[serde(rename = "matchType")]
    match_type: Option<String>,
    confidence: Option<i32>,
    rank: Option<String>,
    #[serde(rename = "usageKey")]
    usage_key: Option<i64>,
    kingdom: Option<String>,
    phylum: Option<String>,
    class: Option<String>,
    order: Option<String>,
    family: Option<String>,
    genus: Option<String>,
    species: Option<String>,
}

impl From<RawMatch> for NameMatch {
    fn from(raw: RawMatch) -> Self {
        let match_type = raw.match_type.as_deref().map(|mt| match mt.to_uppercase().as_str() {
            "EXACT" => MatchType::Exact,
            "FUZZY" => MatchType::Fuzzy,
            "HIGHERRANK" => MatchType::HigherRank,
            _ => MatchType::None,
        });

        let mut lineage = std::collections::BTreeMap::new();
        for (rank, value) in [
            ("kingdom", &raw.kingdom),
            ("phylum", &raw.phylum),
            ("class", &raw.class),
            ("order", &raw.order),
            ("family", &raw.family),
            ("genus", &raw.genus),
            ("species", &raw.species),
        ] {
            if let Some(v) = value {
                lineage.insert(rank.to_string(), v.clone());
            }
        }

        NameMatch {
            match_type,
            confidence: raw.confidence,
            higher_rank_status: match_type == Some(MatchType::HigherRank),
            match_rank: raw.rank,
            lineage,
            taxon_key: raw.usage_key,
        }
    }
}

impl NameResolver for GbifResolver {
    fn resolve(&self, query: &NameQuery) -> Result<NameMatch, RemoteError> {
        let mut response = self
            .agent
            .get(&self.base_url)
            .query("name", &query.query_string)
            .query("rank", &query.query_rank)
            .call()
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        let raw: RawMatch =
            response.body_mut().read_json().map_err(|err| RemoteError::Transport(err.to_string()))?;
        Ok(raw.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_response_maps_fields() {
        let mut server = mockito::Server::new();
        let body = r#"{"matchType":"EXACT","confidence":98,"rank":"SPECIES","usageKey":5231190,
                        "kingdom":"Animalia","phylum":"Chordata","class":"Aves","order":"Passeriformes",
                        "family":"Corvidae","genus":"Corvus","species":"Corvus corax"}"#;
        let _mock = server.mock("GET", mockito::Matcher::Any).with_status(200).with_body(body).create();

        let resolver = GbifResolver::with_base_url(server.url());
        let query = NameQuery { query_string: "Corvus corax".into(), query_rank: "species".into(), specimen_ids: vec![1] };
        let result = resolver.resolve(&query).unwrap();

        assert_eq!(result.match_type, Some(MatchType::Exact));
        assert_eq!(result.taxon_key, Some(5231190));
        assert_eq!(result.lineage.get("genus").map(String::as_str), Some("Corvus"));
    }
}
