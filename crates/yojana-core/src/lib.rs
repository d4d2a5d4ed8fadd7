//! Core domain model for the government scheme sync pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "yojana-core";

/// Text available in multiple languages, keyed by ISO 639-1 code.
///
/// The government portals publish scheme copy in English plus up to five
/// regional languages (hi, ml, ta, kn, te). Backed by a `BTreeMap` so the
/// serialized form is deterministic, which the content hash relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct LocalizedText(pub BTreeMap<String, String>);

impl LocalizedText {
    pub fn english(text: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert("en".to_string(), text.into());
        Self(map)
    }

    pub fn insert(&mut self, lang: impl Into<String>, text: impl Into<String>) {
        self.0.insert(lang.into(), text.into());
    }

    /// Text in the requested language, falling back to English.
    pub fn get(&self, lang: &str) -> Option<&str> {
        self.0
            .get(lang)
            .or_else(|| self.0.get("en"))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.trim().is_empty())
    }
}

/// List-valued counterpart of [`LocalizedText`] (benefits, steps, documents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct LocalizedList(pub BTreeMap<String, Vec<String>>);

impl LocalizedList {
    pub fn english(items: Vec<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert("en".to_string(), items);
        Self(map)
    }

    pub fn get(&self, lang: &str) -> Option<&[String]> {
        self.0
            .get(lang)
            .or_else(|| self.0.get("en"))
            .map(Vec::as_slice)
    }
}

/// Publication status as reported by the issuing portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemeStatus {
    #[default]
    Active,
    Closed,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LandSizeRange {
    pub min_acres: f64,
    pub max_acres: Option<f64>,
}

/// Who a scheme applies to. Empty lists mean "no restriction".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Eligibility {
    pub land_size: Option<LandSizeRange>,
    pub crops: Vec<String>,
    pub states: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApplicationProcess {
    pub steps: LocalizedList,
    pub documents: LocalizedList,
}

/// Everything the pipeline knows about a scheme, minus store-assigned
/// bookkeeping. This is the unit the content hash covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemePayload {
    pub title: LocalizedText,
    pub description: LocalizedText,
    pub benefits: LocalizedList,
    pub eligibility: Eligibility,
    pub application: ApplicationProcess,
    pub issuing_authority: String,
    pub source_url: String,
    pub category: String,
    pub status: SchemeStatus,
}

/// Normalizer output: a candidate record before reconciliation assigns
/// version and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeDraft {
    pub identity_key: String,
    pub payload: SchemePayload,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

/// Canonical persisted scheme record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeRecord {
    pub identity_key: String,
    pub payload: SchemePayload,
    pub content_hash: String,
    pub version: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Lowercases and collapses a string into a hyphenated slug fragment.
pub fn slug_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Stable identity key for a scheme: `{authority-slug}:{name-slug}`.
///
/// Derived only from source-provided fields so the same scheme maps to the
/// same key on every run regardless of which provider surfaced it.
pub fn identity_key(authority: &str, english_name: &str) -> String {
    format!("{}:{}", slug_fragment(authority), slug_fragment(english_name))
}

/// Digest of the canonical JSON encoding of a payload.
///
/// All maps inside `SchemePayload` are `BTreeMap`s and struct fields
/// serialize in declaration order, so equal payloads always produce equal
/// hashes. Serialization of these types cannot fail.
pub fn content_hash(payload: &SchemePayload) -> String {
    let bytes = serde_json::to_vec(payload).expect("scheme payload serializes");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}
