//! Lookup provider contracts + fixture-first and HTTP provider adapters.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use vlr_core::{AddressComponents, CandidateMatch, Coordinates, LookupQuery};
use vlr_storage::{FailureClass, FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vlr-providers";

/// Delay used when a provider throttles without saying for how long.
pub const DEFAULT_THROTTLE_RETRY_SECS: u64 = 5;

pub const GOOGLE_PLACES_BASE_URL: &str = "https://maps.googleapis.com/maps/api/place/textsearch/json";
pub const YELP_SEARCH_BASE_URL: &str = "https://api.yelp.com/v3/businesses/search";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Fixture,
    GooglePlaces,
    Yelp,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("throttled by provider; retry after {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },
    #[error("provider reported no match")]
    NotFound,
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

impl From<FetchError> for ProviderError {
    fn from(err: FetchError) -> Self {
        match err.class() {
            FailureClass::Throttled => Self::Throttled {
                retry_after_secs: err.retry_after_secs().unwrap_or(DEFAULT_THROTTLE_RETRY_SECS),
            },
            FailureClass::NotFound => Self::NotFound,
            FailureClass::Retryable => Self::Transient(err.to_string()),
            FailureClass::Fatal => Self::Fatal(err.to_string()),
        }
    }
}

/// Errors raised while constructing adapters (bad fixture, missing key).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Uniform contract over one external lookup service.
///
/// Implementations translate a query into candidates or a typed error and
/// nothing else: no caching, no retries, no merging.
#[async_trait]
pub trait LookupProvider: Send + Sync {
    fn provider_id(&self) -> &str;
    fn kind(&self) -> ProviderKind;

    async fn lookup(&self, query: &LookupQuery) -> Result<Vec<CandidateMatch>, ProviderError>;
}

/// Provider-native response shapes, translated into [`CandidateMatch`] at the
/// adapter boundary.
#[derive(Debug, Clone)]
pub enum ProviderPayload {
    GooglePlaces(GoogleTextSearchResponse),
    Yelp(YelpSearchResponse),
    Fixture(FixtureResponse),
}

impl ProviderPayload {
    pub fn into_candidates(
        self,
        provider_id: &str,
        link_template: Option<&str>,
    ) -> Result<Vec<CandidateMatch>, ProviderError> {
        match self {
            Self::GooglePlaces(resp) => google_candidates(provider_id, resp),
            Self::Yelp(resp) => Ok(yelp_candidates(provider_id, resp)),
            Self::Fixture(resp) => fixture_candidates(provider_id, link_template, resp),
        }
    }
}

/// A provider result parsed into `T`, kept next to the exact JSON it arrived
/// as so fields the typed view ignores still reach `CandidateMatch::raw`.
#[derive(Debug, Clone, PartialEq)]
pub struct Verbatim<T> {
    pub parsed: T,
    pub json: JsonValue,
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Verbatim<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        let parsed = T::deserialize(&json).map_err(<D::Error as serde::de::Error>::custom)?;
        Ok(Self { parsed, json })
    }
}

impl<T> Serialize for Verbatim<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.json.serialize(serializer)
    }
}

pub fn render_link(template: &str, native_id: &str) -> String {
    template.replace("{id}", native_id)
}

// ---------------------------------------------------------------------------
// Google Places text search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleTextSearchResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<Verbatim<GooglePlace>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GooglePlace {
    pub place_id: String,
    pub name: String,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub geometry: Option<GoogleGeometry>,
    #[serde(default)]
    pub business_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleGeometry {
    pub location: GoogleLatLng,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GoogleLatLng {
    pub lat: f64,
    pub lng: f64,
}

pub fn google_maps_link(name: &str, place_id: &str) -> String {
    match reqwest::Url::parse_with_params(
        "https://www.google.com/maps/search/",
        &[("api", "1"), ("query", name), ("query_place_id", place_id)],
    ) {
        Ok(url) => url.to_string(),
        Err(_) => format!("https://www.google.com/maps/place/?q=place_id:{place_id}"),
    }
}

fn google_candidates(
    provider_id: &str,
    resp: GoogleTextSearchResponse,
) -> Result<Vec<CandidateMatch>, ProviderError> {
    let detail = || resp.error_message.clone().unwrap_or_else(|| resp.status.clone());
    match resp.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" => return Err(ProviderError::NotFound),
        "OVER_QUERY_LIMIT" => {
            return Err(ProviderError::Throttled {
                retry_after_secs: DEFAULT_THROTTLE_RETRY_SECS,
            })
        }
        "REQUEST_DENIED" | "INVALID_REQUEST" => return Err(ProviderError::Fatal(detail())),
        _ => return Err(ProviderError::Transient(detail())),
    }

    Ok(resp
        .results
        .into_iter()
        .filter(|place| place.parsed.business_status.as_deref() != Some("CLOSED_PERMANENTLY"))
        .enumerate()
        .map(|(idx, Verbatim { parsed: place, json: raw })| {
            CandidateMatch {
                provider_id: provider_id.to_string(),
                link: Some(google_maps_link(&place.name, &place.place_id)),
                native_id: place.place_id,
                name: place.name,
                address: place.formatted_address,
                address_parts: AddressComponents::default(),
                coordinates: place.geometry.map(|g| Coordinates {
                    lat: g.location.lat,
                    lng: g.location.lng,
                }),
                rank: Some(idx as u32 + 1),
                confidence: None,
                raw,
            }
        })
        .collect())
}

pub struct GooglePlacesProvider {
    provider_id: String,
    api_key: String,
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl GooglePlacesProvider {
    pub fn new(provider_id: impl Into<String>, api_key: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            provider_id: provider_id.into(),
            api_key: api_key.into(),
            base_url: GOOGLE_PLACES_BASE_URL.to_string(),
            http,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn request_url(&self, query: &LookupQuery) -> Result<reqwest::Url, ProviderError> {
        let mut params = vec![
            ("query".to_string(), query.search_text()),
            ("key".to_string(), self.api_key.clone()),
        ];
        if let Some(coords) = query.coordinates {
            params.push(("location".to_string(), format!("{},{}", coords.lat, coords.lng)));
            params.push(("radius".to_string(), "500".to_string()));
        }
        reqwest::Url::parse_with_params(&self.base_url, &params)
            .map_err(|err| ProviderError::Fatal(format!("invalid google places url: {err}")))
    }
}

#[async_trait]
impl LookupProvider for GooglePlacesProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::GooglePlaces
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<Vec<CandidateMatch>, ProviderError> {
        let url = self.request_url(query)?;
        let resp = self.http.get(&self.provider_id, url, None).await?;
        let parsed: GoogleTextSearchResponse = serde_json::from_slice(&resp.body)
            .map_err(|err| ProviderError::Transient(format!("decoding google places response: {err}")))?;
        ProviderPayload::GooglePlaces(parsed).into_candidates(&self.provider_id, None)
    }
}

// ---------------------------------------------------------------------------
// Yelp Fusion business search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct YelpSearchResponse {
    #[serde(default)]
    pub businesses: Vec<Verbatim<YelpBusiness>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YelpBusiness {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub coordinates: Option<YelpCoordinates>,
    #[serde(default)]
    pub location: Option<YelpLocation>,
    #[serde(default)]
    pub is_closed: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct YelpCoordinates {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YelpLocation {
    #[serde(default)]
    pub address1: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub display_address: Vec<String>,
}

/// Stable business link. Search result URLs carry per-request tracking params.
pub fn yelp_link(business: &YelpBusiness) -> String {
    if let Some(alias) = business.alias.as_deref().filter(|a| !a.is_empty()) {
        return format!("https://www.yelp.com/biz/{alias}");
    }
    match business.url.as_deref() {
        Some(url) => url.split('?').next().unwrap_or(url).to_string(),
        None => format!("https://www.yelp.com/biz/{}", business.id),
    }
}

fn yelp_candidates(provider_id: &str, resp: YelpSearchResponse) -> Vec<CandidateMatch> {
    resp.businesses
        .into_iter()
        .filter(|b| b.parsed.is_closed != Some(true))
        .enumerate()
        .map(|(idx, Verbatim { parsed: business, json: raw })| {
            let link = yelp_link(&business);
            let (address, address_parts) = match &business.location {
                Some(loc) => (
                    if loc.display_address.is_empty() {
                        loc.address1.clone()
                    } else {
                        Some(loc.display_address.join(", "))
                    },
                    AddressComponents {
                        street: loc.address1.clone().filter(|s| !s.is_empty()),
                        locality: loc.city.clone(),
                        region: loc.state.clone(),
                        postal_code: loc.zip_code.clone().filter(|s| !s.is_empty()),
                        country: loc.country.clone(),
                    },
                ),
                None => (None, AddressComponents::default()),
            };
            let coordinates = business.coordinates.and_then(|c| match (c.latitude, c.longitude) {
                (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
                _ => None,
            });
            CandidateMatch {
                provider_id: provider_id.to_string(),
                native_id: business.id,
                name: business.name,
                address,
                address_parts,
                coordinates,
                rank: Some(idx as u32 + 1),
                confidence: None,
                link: Some(link),
                raw,
            }
        })
        .collect()
}

/// Yelp answers a location it cannot geocode with a 400 carrying
/// `LOCATION_NOT_FOUND` instead of an empty result set.
pub fn yelp_fetch_error(err: FetchError) -> ProviderError {
    match err {
        FetchError::HttpStatus {
            status: 400,
            ref body_excerpt,
            ..
        } if body_excerpt.contains("LOCATION_NOT_FOUND") => ProviderError::NotFound,
        err => err.into(),
    }
}

pub struct YelpProvider {
    provider_id: String,
    api_key: String,
    base_url: String,
    limit: u32,
    http: Arc<HttpFetcher>,
}

impl YelpProvider {
    pub fn new(provider_id: impl Into<String>, api_key: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            provider_id: provider_id.into(),
            api_key: api_key.into(),
            base_url: YELP_SEARCH_BASE_URL.to_string(),
            limit: 5,
            http,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `None` when the query carries nothing Yelp can anchor a search on.
    pub fn request_url(&self, query: &LookupQuery) -> Result<Option<reqwest::Url>, ProviderError> {
        let mut params = vec![
            ("term".to_string(), query.name.clone()),
            ("limit".to_string(), self.limit.to_string()),
        ];
        if let Some(coords) = query.coordinates {
            params.push(("latitude".to_string(), coords.lat.to_string()));
            params.push(("longitude".to_string(), coords.lng.to_string()));
        } else {
            let mut location = Vec::new();
            if let Some(address) = query.address.as_deref().filter(|a| !a.trim().is_empty()) {
                location.push(address.trim().to_string());
            }
            for part in [&query.components.locality, &query.components.region, &query.components.postal_code]
                .into_iter()
                .flatten()
            {
                if !location.iter().any(|l| l.contains(part.as_str())) {
                    location.push(part.clone());
                }
            }
            if location.is_empty() {
                return Ok(None);
            }
            params.push(("location".to_string(), location.join(", ")));
        }
        reqwest::Url::parse_with_params(&self.base_url, &params)
            .map(Some)
            .map_err(|err| ProviderError::Fatal(format!("invalid yelp url: {err}")))
    }
}

#[async_trait]
impl LookupProvider for YelpProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Yelp
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<Vec<CandidateMatch>, ProviderError> {
        let Some(url) = self.request_url(query)? else {
            debug!(venue_id = %query.venue_id, "no location to anchor yelp search");
            return Err(ProviderError::NotFound);
        };
        let resp = self
            .http
            .get(&self.provider_id, url, Some(&self.api_key))
            .await
            .map_err(yelp_fetch_error)?;
        let parsed: YelpSearchResponse = serde_json::from_slice(&resp.body)
            .map_err(|err| ProviderError::Transient(format!("decoding yelp response: {err}")))?;
        ProviderPayload::Yelp(parsed).into_candidates(&self.provider_id, None)
    }
}

// ---------------------------------------------------------------------------
// Fixture provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub provider_id: String,
    #[serde(default)]
    pub link_template: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Keyed by venue id, or by lowercased venue name as a fallback.
    pub responses: BTreeMap<String, FixtureResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureResponse {
    #[serde(default)]
    pub candidates: Vec<Verbatim<FixtureCandidate>>,
    #[serde(default)]
    pub error: Option<FixtureError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCandidate {
    pub native_id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub address_parts: AddressComponents,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureError {
    Throttled { retry_after_secs: u64 },
    NotFound,
    Transient { message: String },
    Fatal { message: String },
}

impl From<FixtureError> for ProviderError {
    fn from(err: FixtureError) -> Self {
        match err {
            FixtureError::Throttled { retry_after_secs } => Self::Throttled { retry_after_secs },
            FixtureError::NotFound => Self::NotFound,
            FixtureError::Transient { message } => Self::Transient(message),
            FixtureError::Fatal { message } => Self::Fatal(message),
        }
    }
}

fn fixture_candidates(
    provider_id: &str,
    link_template: Option<&str>,
    resp: FixtureResponse,
) -> Result<Vec<CandidateMatch>, ProviderError> {
    if let Some(err) = resp.error {
        return Err(err.into());
    }
    Ok(resp
        .candidates
        .into_iter()
        .map(|Verbatim { parsed: c, json: raw }| {
            let link = c
                .link
                .or_else(|| link_template.map(|t| render_link(t, &c.native_id)));
            CandidateMatch {
                provider_id: provider_id.to_string(),
                native_id: c.native_id,
                name: c.name,
                address: c.address,
                address_parts: c.address_parts,
                coordinates: c.coordinates,
                rank: c.rank,
                confidence: c.confidence,
                link,
                raw,
            }
        })
        .collect())
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline provider answering from a canned response bundle.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    provider_id: String,
    link_template: Option<String>,
    responses: BTreeMap<String, FixtureResponse>,
}

impl FixtureProvider {
    pub fn from_bundle(provider_id: impl Into<String>, bundle: FixtureBundle) -> Self {
        let responses = bundle
            .responses
            .into_iter()
            .map(|(key, resp)| (key.trim().to_lowercase(), resp))
            .collect();
        Self {
            provider_id: provider_id.into(),
            link_template: bundle.link_template,
            responses,
        }
    }

    pub fn from_path(provider_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_bundle(provider_id, load_fixture_bundle(path)?))
    }

    pub fn with_link_template(mut self, template: Option<String>) -> Self {
        if template.is_some() {
            self.link_template = template;
        }
        self
    }

    fn response_for(&self, query: &LookupQuery) -> Option<&FixtureResponse> {
        self.responses
            .get(&query.venue_id.trim().to_lowercase())
            .or_else(|| self.responses.get(&query.name.trim().to_lowercase()))
    }
}

#[async_trait]
impl LookupProvider for FixtureProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Fixture
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<Vec<CandidateMatch>, ProviderError> {
        let resp = self.response_for(query).cloned().unwrap_or_default();
        ProviderPayload::Fixture(resp).into_candidates(&self.provider_id, self.link_template.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

pub type ScriptedResponse = Result<Vec<CandidateMatch>, ProviderError>;

/// Provider replaying per-venue response sequences. The last scripted
/// response repeats once the sequence is exhausted.
pub struct ScriptedProvider {
    provider_id: String,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(self, venue_id: impl Into<String>, responses: Vec<ScriptedResponse>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(venue_id.into(), responses.into());
        }
        self
    }

    pub fn calls_for(&self, venue_id: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(venue_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|calls| calls.values().sum()).unwrap_or(0)
    }

    fn next_response(&self, venue_id: &str) -> ScriptedResponse {
        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| ProviderError::Fatal("scripted provider poisoned".to_string()))?;
        match scripts.get_mut(venue_id) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::NotFound)),
            Some(queue) => queue.front().cloned().unwrap_or(Err(ProviderError::NotFound)),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl LookupProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Fixture
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<Vec<CandidateMatch>, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(query.venue_id.clone()).or_default() += 1;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_response(&query.venue_id)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Everything needed to construct one provider adapter.
#[derive(Clone, Default)]
pub struct ProviderOptions {
    pub api_key: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub link_template: Option<String>,
    pub base_url: Option<String>,
    pub http: Option<Arc<HttpFetcher>>,
}

pub fn provider_for(
    provider_id: &str,
    kind: ProviderKind,
    options: ProviderOptions,
) -> Result<Arc<dyn LookupProvider>, AdapterError> {
    match kind {
        ProviderKind::Fixture => {
            let path = options.fixture_path.ok_or_else(|| {
                AdapterError::Message(format!("fixture provider {provider_id} needs a fixture_path"))
            })?;
            let provider = FixtureProvider::from_path(provider_id, &path)?
                .with_link_template(options.link_template);
            Ok(Arc::new(provider))
        }
        ProviderKind::GooglePlaces => {
            let (api_key, http) = http_parts(provider_id, options.api_key, options.http)?;
            let mut provider = GooglePlacesProvider::new(provider_id, api_key, http);
            if let Some(base_url) = options.base_url {
                provider = provider.with_base_url(base_url);
            }
            Ok(Arc::new(provider))
        }
        ProviderKind::Yelp => {
            let (api_key, http) = http_parts(provider_id, options.api_key, options.http)?;
            let mut provider = YelpProvider::new(provider_id, api_key, http);
            if let Some(base_url) = options.base_url {
                provider = provider.with_base_url(base_url);
            }
            Ok(Arc::new(provider))
        }
    }
}

fn http_parts(
    provider_id: &str,
    api_key: Option<String>,
    http: Option<Arc<HttpFetcher>>,
) -> Result<(String, Arc<HttpFetcher>), AdapterError> {
    let api_key = api_key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| AdapterError::Message(format!("provider {provider_id} has no api key configured")))?;
    let http = http.ok_or_else(|| AdapterError::Message(format!("provider {provider_id} needs an http client")))?;
    Ok((api_key, http))
}
