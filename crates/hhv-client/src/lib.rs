//! Paged job-board API client: employer lookup with search fallback and
//! vacancy pagination.

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hhv_core::{parse_published_at, Listing, Organization, Salary};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "hhv-client";

pub const DEFAULT_BASE_URL: &str = "https://api.hh.ru/";
pub const DEFAULT_USER_AGENT: &str = "hhv-harvester/0.1 (hhv-maintainers@example.com)";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("cannot build url for {path}: {reason}")]
    InvalidUrl { path: String, reason: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// The API's "no such entity" signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
    }

    /// The API's malformed-request signal, answered with a text search.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if *status == StatusCode::BAD_REQUEST.as_u16())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

/// One GET round trip against the API. Non-2xx statuses surface as
/// [`FetchError::HttpStatus`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("parsing base url {base}"))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        let url = self.base_url.join(path).map_err(|err| FetchError::InvalidUrl {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        let span = info_span!("http_fetch", url = %url);

        async move {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            info!(status = status.as_u16(), %final_url, "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse { final_url, body })
        }
        .instrument(span)
        .await
    }
}

/// Fixed delays between requests. These pace the client to the API's
/// informal rate limits; they are not retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub between_resolutions: Duration,
    pub between_pages: Duration,
    pub between_organizations: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            between_resolutions: Duration::from_millis(200),
            between_pages: Duration::from_millis(250),
            between_organizations: Duration::from_secs(1),
        }
    }
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            between_resolutions: Duration::ZERO,
            between_pages: Duration::ZERO,
            between_organizations: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationPolicy {
    pub per_page: u32,
    /// Hard ceiling on page requests per organization, whatever `pages` claims.
    pub max_pages: u32,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            per_page: 100,
            max_pages: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(text) => text,
            RawId::Number(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    RawId::deserialize(deserializer).map(String::from)
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Option::<RawId>::deserialize(deserializer).map(|raw| raw.map(String::from))
}

/// `employers/{id}` payload, also the shape of `employers` search items.
#[derive(Debug, Clone, Deserialize)]
pub struct EmployerDto {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub alternate_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub open_vacancies: Option<i32>,
}

impl EmployerDto {
    pub fn into_organization(self) -> Organization {
        Organization {
            id: self.id,
            name: self.name,
            url: self.alternate_url,
            description: self.description,
            open_listings: self.open_vacancies.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmployerRefDto {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SalaryDto {
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnippetDto {
    #[serde(default)]
    pub requirement: Option<String>,
    #[serde(default)]
    pub responsibility: Option<String>,
}

/// One item of the `vacancies` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct VacancyDto {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub employer: Option<EmployerRefDto>,
    #[serde(default)]
    pub salary: Option<SalaryDto>,
    #[serde(default)]
    pub alternate_url: Option<String>,
    #[serde(default)]
    pub snippet: Option<SnippetDto>,
    #[serde(default)]
    pub published_at: Option<String>,
}

impl VacancyDto {
    /// `fetched_for` stands in when the payload omits the employer id.
    pub fn into_listing(self, fetched_for: &str) -> Listing {
        let organization_id = self
            .employer
            .and_then(|e| e.id)
            .unwrap_or_else(|| fetched_for.to_string());
        let salary = self
            .salary
            .and_then(|s| Salary::new(s.from, s.to, s.currency));
        let snippet = self.snippet.unwrap_or_default();
        let published_at = self.published_at.as_deref().and_then(|raw| {
            let parsed = parse_published_at(raw);
            if parsed.is_none() {
                debug!(listing_id = %self.id, raw, "unparseable published_at");
            }
            parsed
        });

        Listing {
            id: self.id,
            organization_id,
            title: self.name,
            salary,
            url: self.alternate_url,
            requirement: snippet.requirement,
            responsibility: snippet.responsibility,
            published_at,
        }
    }
}

/// A paged collection envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PageDto<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub pages: Option<u32>,
}

/// Listings keyed by organization id, in the order the ids were fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingsByOrganization {
    entries: Vec<(String, Vec<Listing>)>,
}

impl ListingsByOrganization {
    /// Replaces the entry for a repeated id in place.
    pub fn insert(&mut self, organization_id: String, listings: Vec<Listing>) {
        match self.entries.iter_mut().find(|(id, _)| *id == organization_id) {
            Some(entry) => entry.1 = listings,
            None => self.entries.push((organization_id, listings)),
        }
    }

    pub fn get(&self, organization_id: &str) -> Option<&[Listing]> {
        self.entries
            .iter()
            .find(|(id, _)| id == organization_id)
            .map(|(_, listings)| listings.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Listing])> {
        self.entries
            .iter()
            .map(|(id, listings)| (id.as_str(), listings.as_slice()))
    }

    pub fn total_listings(&self) -> usize {
        self.entries.iter().map(|(_, listings)| listings.len()).sum()
    }
}

pub struct JobBoardClient<T = HttpFetcher> {
    transport: T,
    pacing: Pacing,
    pagination: PaginationPolicy,
}

impl<T: Transport> JobBoardClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pacing: Pacing::default(),
            pagination: PaginationPolicy::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationPolicy) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn get_json<D: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<D, FetchError> {
        let response = self.transport.get(path, query).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Looks up one employer. Never fails: absence covers not-found and any
    /// transport trouble, and a malformed-request answer retries the id as
    /// search text.
    pub async fn resolve_organization(&self, organization_id: &str) -> Option<Organization> {
        let path = format!("employers/{}", urlencoding::encode(organization_id));
        match self.get_json::<EmployerDto>(&path, &[]).await {
            Ok(dto) => Some(dto.into_organization()),
            Err(err) if err.is_not_found() => {
                info!(organization_id, "organization not found");
                None
            }
            Err(err) if err.is_bad_request() => {
                warn!(organization_id, "lookup rejected; falling back to text search");
                self.search_organization(organization_id).await
            }
            Err(err) => {
                warn!(organization_id, error = %err, "organization lookup failed");
                None
            }
        }
    }

    async fn search_organization(&self, text: &str) -> Option<Organization> {
        let query = [
            ("text", text.to_string()),
            ("only_with_vacancies", "true".to_string()),
            ("per_page", "1".to_string()),
        ];
        match self.get_json::<PageDto<EmployerDto>>("employers", &query).await {
            Ok(page) => {
                let found = page.items.into_iter().next().map(EmployerDto::into_organization);
                if found.is_none() {
                    info!(text, "text search found no organization");
                }
                found
            }
            Err(err) => {
                warn!(text, error = %err, "organization text search failed");
                None
            }
        }
    }

    pub async fn resolve_many_organizations(&self, organization_ids: &[String]) -> Vec<Organization> {
        let mut resolved = Vec::with_capacity(organization_ids.len());
        for (idx, organization_id) in organization_ids.iter().enumerate() {
            if idx > 0 {
                self.pause(self.pacing.between_resolutions).await;
            }
            if let Some(organization) = self.resolve_organization(organization_id).await {
                resolved.push(organization);
            }
        }
        info!(
            requested = organization_ids.len(),
            resolved = resolved.len(),
            "organizations resolved"
        );
        resolved
    }

    /// Employers with the most open vacancies. Empty on any failure.
    pub async fn discover_top_organizations(&self, limit: u32) -> Vec<Organization> {
        let query = [
            ("only_with_vacancies", "true".to_string()),
            ("per_page", limit.to_string()),
            ("sort_by", "by_vacancies_open".to_string()),
        ];
        match self.get_json::<PageDto<EmployerDto>>("employers", &query).await {
            Ok(page) => page
                .items
                .into_iter()
                .map(EmployerDto::into_organization)
                .collect(),
            Err(err) => {
                warn!(error = %err, "top organization search failed");
                Vec::new()
            }
        }
    }

    /// Pages through an organization's salaried, non-archived vacancies.
    ///
    /// Stops on the last reported page, an empty page, the page ceiling, or
    /// the first failure. Whatever was gathered before a failure is returned.
    pub async fn fetch_listings(&self, organization_id: &str) -> Vec<Listing> {
        let mut listings = Vec::new();
        let mut page: u32 = 0;

        loop {
            if page >= self.pagination.max_pages {
                warn!(
                    organization_id,
                    max_pages = self.pagination.max_pages,
                    "page ceiling reached"
                );
                break;
            }
            if page > 0 {
                self.pause(self.pacing.between_pages).await;
            }

            let query = [
                ("employer_id", organization_id.to_string()),
                ("page", page.to_string()),
                ("per_page", self.pagination.per_page.to_string()),
                ("only_with_salary", "true".to_string()),
                ("archived", "false".to_string()),
            ];
            let payload = match self
                .get_json::<PageDto<VacancyDto>>("vacancies", &query)
                .await
            {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(
                        organization_id,
                        page,
                        kept = listings.len(),
                        error = %err,
                        "listing page failed; keeping partial results"
                    );
                    break;
                }
            };

            if payload.items.is_empty() {
                debug!(organization_id, page, "empty page");
                break;
            }

            let received = payload.items.len();
            listings.extend(
                payload
                    .items
                    .into_iter()
                    .map(|dto| dto.into_listing(organization_id)),
            );
            let pages = payload.pages.unwrap_or(0);
            debug!(organization_id, page, pages, received, "listing page fetched");

            if page.saturating_add(1) >= pages {
                break;
            }
            page += 1;
        }

        listings
    }

    pub async fn fetch_all_listings(&self, organization_ids: &[String]) -> ListingsByOrganization {
        let mut all = ListingsByOrganization::default();
        for (idx, organization_id) in organization_ids.iter().enumerate() {
            if idx > 0 {
                self.pause(self.pacing.between_organizations).await;
            }
            let listings = self.fetch_listings(organization_id).await;
            info!(organization_id = %organization_id, count = listings.len(), "listings fetched");
            all.insert(organization_id.clone(), listings);
        }
        all
    }
}
