//! Compile-time `diesel` schema for the two statically-shaped tables. The
//! ingest-staging table has no entry here — its columns are data-driven from
//! the schema descriptor and addressed through raw SQL (see
//! `crate::ingest::staging`).

diesel::table! {
    specimen (specimen_id) {
        specimen_id -> BigInt,
        nuc_raw -> Text,
        nuc_san -> Nullable<Text>,
        hash -> Text,
        last_updated -> Date,
        review -> Bool,
        include -> Bool,
        taxon_key -> Nullable<BigInt>,
        taxon_kingdom -> Nullable<Text>,
        taxon_phylum -> Nullable<Text>,
        taxon_class -> Nullable<Text>,
        taxon_order -> Nullable<Text>,
        taxon_family -> Nullable<Text>,
        taxon_subfamily -> Nullable<Text>,
        taxon_tribe -> Nullable<Text>,
        taxon_genus -> Nullable<Text>,
        taxon_species -> Nullable<Text>,
        taxon_subspecies -> Nullable<Text>,
        identification_rank -> Nullable<Text>,
        country_iso -> Nullable<Text>,
        lat -> Nullable<Double>,
        lon -> Nullable<Double>,
        kg_zone -> Nullable<Text>,
        checks -> BigInt,
        geo_info -> Nullable<Double>,
        processing_info -> Nullable<Text>,
    }
}

diesel::table! {
    climate_data (taxon_key) {
        taxon_key -> BigInt,
        kg_af -> BigInt,
        kg_am -> BigInt,
        kg_as -> BigInt,
        kg_aw -> BigInt,
        kg_bsh -> BigInt,
        kg_bsk -> BigInt,
        kg_bwh -> BigInt,
        kg_bwk -> BigInt,
        kg_cfa -> BigInt,
        kg_cfb -> BigInt,
        kg_cfc -> BigInt,
        kg_csa -> BigInt,
        kg_csb -> BigInt,
        kg_csc -> BigInt,
        kg_cwa -> BigInt,
        kg_cwb -> BigInt,
        kg_cwc -> BigInt,
        kg_dfa -> BigInt,
        kg_dfb -> BigInt,
        kg_dfc -> BigInt,
        kg_dfd -> BigInt,
        kg_dsa -> BigInt,
        kg_dsb -> BigInt,
        kg_dsc -> BigInt,
        kg_dsd -> BigInt,
        kg_dwa -> BigInt,
        kg_dwb -> BigInt,
        kg_dwc -> BigInt,
        kg_dwd -> BigInt,
        kg_ef -> BigInt,
        kg_et -> BigInt,
        kg_ocean -> BigInt,
        country_codes -> Text,
    }
}
