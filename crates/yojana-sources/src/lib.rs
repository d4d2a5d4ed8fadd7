//! Source contracts, per-provider fetchers, and the raw-record normalizer.
//!
//! Each government portal gets a [`SchemeSource`] implementation returning a
//! uniform [`RawSchemeRecord`] shape, so adding a provider never touches the
//! reconciler or writer.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;
use yojana_core::{
    content_hash, identity_key, ApplicationProcess, Eligibility, LandSizeRange, LocalizedList,
    LocalizedText, SchemeDraft, SchemePayload, SchemeStatus,
};
use yojana_store::{HttpError, HttpFetcher};

pub const CRATE_NAME: &str = "yojana-sources";

/// How a provider's endpoint is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseMode {
    JsonApi,
    HtmlPortal,
}

/// Registry entry for one provider (loaded from `sources.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDescriptor {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: ParseMode,
    pub endpoint: String,
    /// Issuing authority stamped onto records that do not carry their own.
    pub authority: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_category() -> String {
    "central".to_string()
}

/// Per-source fetch failure. Collected by the pipeline, never thrown past
/// sibling sources.
#[derive(Debug, Error)]
#[error("source '{source_id}' fetch failed: {cause}")]
pub struct FetchError {
    pub source_id: String,
    #[source]
    pub cause: FetchCause,
}

#[derive(Debug, Error)]
pub enum FetchCause {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("decoding response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("parsing document: {0}")]
    Parse(String),
}

/// Text that arrives either as a plain string or as a language map. The
/// portals are inconsistent about this, so both wire shapes are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawText {
    Plain(String),
    Localized(BTreeMap<String, String>),
}

impl RawText {
    pub fn into_localized(self) -> LocalizedText {
        match self {
            RawText::Plain(text) => LocalizedText::english(text),
            RawText::Localized(map) => LocalizedText(map),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawList {
    Plain(Vec<String>),
    Localized(BTreeMap<String, Vec<String>>),
}

impl RawList {
    pub fn into_localized(self) -> LocalizedList {
        match self {
            RawList::Plain(items) => LocalizedList::english(items),
            RawList::Localized(map) => LocalizedList(map),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawLandSize {
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawEligibility {
    #[serde(default)]
    pub land_size: Option<RawLandSize>,
    #[serde(default)]
    pub crops: Vec<String>,
    #[serde(default)]
    pub states: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawApplication {
    #[serde(default)]
    pub steps: Option<RawList>,
    #[serde(default)]
    pub documents: Option<RawList>,
}

/// Loose provider payload, camelCase on the wire. Everything optional;
/// the normalizer decides what is mandatory.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawSchemeRecord {
    #[serde(default)]
    pub name: Option<RawText>,
    #[serde(default)]
    pub description: Option<RawText>,
    #[serde(default)]
    pub benefits: Option<RawList>,
    #[serde(default)]
    pub eligibility: Option<RawEligibility>,
    #[serde(default, alias = "applicationProcess")]
    pub application: Option<RawApplication>,
    #[serde(default)]
    pub issuing_authority: Option<String>,
    #[serde(default)]
    pub official_url: Option<String>,
    #[serde(default, alias = "type")]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Per-provider retrieval capability.
#[async_trait]
pub trait SchemeSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn parse_mode(&self) -> ParseMode;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<Vec<RawSchemeRecord>, FetchError>;
}

pub fn source_for_descriptor(descriptor: &SourceDescriptor) -> Box<dyn SchemeSource> {
    match descriptor.mode {
        ParseMode::JsonApi => Box::new(JsonApiSource::new(descriptor.clone())),
        ParseMode::HtmlPortal => Box::new(HtmlPortalSource::new(descriptor.clone())),
    }
}

/// Source whose endpoint returns scheme records as JSON, either a bare
/// array or wrapped as `{"schemes": [...]}`.
#[derive(Debug, Clone)]
pub struct JsonApiSource {
    descriptor: SourceDescriptor,
}

impl JsonApiSource {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn parse_body(&self, body: &[u8]) -> Result<Vec<RawSchemeRecord>, FetchCause> {
        let value: JsonValue = serde_json::from_slice(body)?;
        let items = match value {
            JsonValue::Array(items) => JsonValue::Array(items),
            JsonValue::Object(mut obj) => obj
                .remove("schemes")
                .ok_or_else(|| FetchCause::Parse("missing 'schemes' array".to_string()))?,
            other => {
                return Err(FetchCause::Parse(format!(
                    "unexpected top-level JSON value: {}",
                    json_kind(&other)
                )))
            }
        };
        let mut records: Vec<RawSchemeRecord> = serde_json::from_value(items)?;
        for record in &mut records {
            self.stamp_defaults(record);
        }
        Ok(records)
    }

    fn stamp_defaults(&self, record: &mut RawSchemeRecord) {
        if record.issuing_authority.is_none() {
            record.issuing_authority = Some(self.descriptor.authority.clone());
        }
        if record.official_url.is_none() {
            record.official_url = Some(self.descriptor.endpoint.clone());
        }
        if record.category.is_none() {
            record.category = Some(self.descriptor.category.clone());
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[async_trait]
impl SchemeSource for JsonApiSource {
    fn source_id(&self) -> &str {
        &self.descriptor.source_id
    }

    fn parse_mode(&self) -> ParseMode {
        ParseMode::JsonApi
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<Vec<RawSchemeRecord>, FetchError> {
        let response = http
            .fetch_bytes(run_id, self.source_id(), &self.descriptor.endpoint)
            .await
            .map_err(|cause| self.fetch_error(cause.into()))?;
        self.parse_body(&response.body)
            .map_err(|cause| self.fetch_error(cause))
    }
}

impl JsonApiSource {
    fn fetch_error(&self, cause: FetchCause) -> FetchError {
        FetchError {
            source_id: self.descriptor.source_id.clone(),
            cause,
        }
    }
}

/// Source scraped from a portal's HTML. One record per `.scheme-card`
/// element (falling back to `article`), fields pulled with CSS selectors.
#[derive(Debug, Clone)]
pub struct HtmlPortalSource {
    descriptor: SourceDescriptor,
}

impl HtmlPortalSource {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn parse_html(&self, html: &str) -> Result<Vec<RawSchemeRecord>, FetchCause> {
        let document = Html::parse_document(html);
        let card_selector = parse_selector(".scheme-card, article.scheme")?;

        let mut records = Vec::new();
        for card in document.select(&card_selector) {
            let fragment = Html::parse_fragment(&card.html());

            let Some(title) = select_first_text(&fragment, "h1, h2, h3")? else {
                // A card with no heading carries nothing identity-forming.
                continue;
            };
            let description = select_first_text(&fragment, ".description, p")?;
            let benefits = select_all_texts(&fragment, ".benefits li, li")?;
            let url = select_first_attr(&fragment, "a[href]", "href")?;

            records.push(RawSchemeRecord {
                name: Some(RawText::Plain(title)),
                description: description.map(RawText::Plain),
                benefits: if benefits.is_empty() {
                    None
                } else {
                    Some(RawList::Plain(benefits))
                },
                eligibility: None,
                application: None,
                issuing_authority: Some(self.descriptor.authority.clone()),
                official_url: Some(url.unwrap_or_else(|| self.descriptor.endpoint.clone())),
                category: Some(self.descriptor.category.clone()),
                status: None,
            });
        }
        Ok(records)
    }

    fn fetch_error(&self, cause: FetchCause) -> FetchError {
        FetchError {
            source_id: self.descriptor.source_id.clone(),
            cause,
        }
    }
}

#[async_trait]
impl SchemeSource for HtmlPortalSource {
    fn source_id(&self) -> &str {
        &self.descriptor.source_id
    }

    fn parse_mode(&self) -> ParseMode {
        ParseMode::HtmlPortal
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<Vec<RawSchemeRecord>, FetchError> {
        let response = http
            .fetch_bytes(run_id, self.source_id(), &self.descriptor.endpoint)
            .await
            .map_err(|cause| self.fetch_error(cause.into()))?;
        let html = String::from_utf8_lossy(&response.body);
        self.parse_html(&html).map_err(|cause| self.fetch_error(cause))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, FetchCause> {
    Selector::parse(selector).map_err(|e| FetchCause::Parse(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, FetchCause> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, FetchCause> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, FetchCause> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Per-record normalization failure. The record is skipped and counted;
/// it never aborts the run.
#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("missing mandatory field '{0}'")]
    MissingField(&'static str),
}

/// Maps a raw provider record onto a canonical [`SchemeDraft`].
///
/// Deterministic by construction: the same raw input always yields the same
/// identity key and content hash. Missing identity-forming fields reject
/// the record; everything else falls back to defined defaults.
pub fn normalize(
    raw: &RawSchemeRecord,
    fetched_at: DateTime<Utc>,
) -> Result<SchemeDraft, NormalizationError> {
    let title = raw
        .name
        .clone()
        .map(RawText::into_localized)
        .filter(|t| !t.is_empty())
        .ok_or(NormalizationError::MissingField("name"))?;
    let english_name = title
        .get("en")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizationError::MissingField("name.en"))?
        .to_string();
    let authority = raw
        .issuing_authority
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizationError::MissingField("issuingAuthority"))?
        .to_string();

    let description = raw
        .description
        .clone()
        .map(RawText::into_localized)
        .unwrap_or_default();
    let benefits = raw
        .benefits
        .clone()
        .map(RawList::into_localized)
        .unwrap_or_default();
    let eligibility = raw
        .eligibility
        .clone()
        .map(|e| Eligibility {
            land_size: e.land_size.map(|l| LandSizeRange {
                min_acres: l.min,
                max_acres: l.max,
            }),
            crops: e.crops,
            states: e.states,
        })
        .unwrap_or_default();
    let application = raw
        .application
        .clone()
        .map(|a| ApplicationProcess {
            steps: a.steps.map(RawList::into_localized).unwrap_or_default(),
            documents: a.documents.map(RawList::into_localized).unwrap_or_default(),
        })
        .unwrap_or_default();

    let payload = SchemePayload {
        title,
        description,
        benefits,
        eligibility,
        application,
        issuing_authority: authority.clone(),
        source_url: raw.official_url.clone().unwrap_or_default(),
        category: raw.category.clone().unwrap_or_else(default_category),
        status: parse_status(raw.status.as_deref()),
    };

    let hash = content_hash(&payload);
    Ok(SchemeDraft {
        identity_key: identity_key(&authority, &english_name),
        payload,
        content_hash: hash,
        fetched_at,
    })
}

fn parse_status(status: Option<&str>) -> SchemeStatus {
    match status.map(str::to_ascii_lowercase).as_deref() {
        Some("closed") => SchemeStatus::Closed,
        Some("paused") => SchemeStatus::Paused,
        _ => SchemeStatus::Active,
    }
}
