//! Ingestion pipeline orchestration: choose the employers to harvest, pull
//! their profiles and vacancies, and upsert everything into the store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hhv_client::{
    HttpClientConfig, HttpFetcher, JobBoardClient, Pacing, PaginationPolicy, Transport,
    DEFAULT_BASE_URL, DEFAULT_USER_AGENT,
};
use hhv_store::{ConnectionFactory, DatabaseConfig, IngestSink, PgStore};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hhv-sync";

pub const DEFAULT_SYNC_CONFIG_PATH: &str = "config/harvest.yaml";

/// An employer the pipeline falls back to when discovery finds nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownOrganization {
    pub name: String,
    pub id: String,
}

impl KnownOrganization {
    fn new(name: &str, id: &str) -> Self {
        Self {
            name: name.to_string(),
            id: id.to_string(),
        }
    }
}

pub fn default_fallback_organizations() -> Vec<KnownOrganization> {
    vec![
        KnownOrganization::new("Yandex", "1740"),
        KnownOrganization::new("Sber", "3529"),
        KnownOrganization::new("T-Bank", "78638"),
        KnownOrganization::new("VK", "15478"),
        KnownOrganization::new("Kaspersky Lab", "1057"),
        KnownOrganization::new("Ozon", "2180"),
        KnownOrganization::new("Avito", "84585"),
        KnownOrganization::new("MTS", "3776"),
        KnownOrganization::new("Wildberries", "87021"),
        KnownOrganization::new("Rostelecom", "2748"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub per_page: u32,
    pub max_pages: u32,
    pub discovery_limit: u32,
    pub resolution_delay_ms: u64,
    pub page_delay_ms: u64,
    pub organization_delay_ms: u64,
    pub fallback_organizations: Vec<KnownOrganization>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let pacing = Pacing::default();
        let pagination = PaginationPolicy::default();
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 10,
            per_page: pagination.per_page,
            max_pages: pagination.max_pages,
            discovery_limit: 10,
            resolution_delay_ms: pacing.between_resolutions.as_millis() as u64,
            page_delay_ms: pacing.between_pages.as_millis() as u64,
            organization_delay_ms: pacing.between_organizations.as_millis() as u64,
            fallback_organizations: default_fallback_organizations(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing harvest config")
    }

    /// Reads `path` (or the default location) when present, then applies
    /// `HHV_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SYNC_CONFIG_PATH));
        let base = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))?
        } else {
            Self::default()
        };
        Ok(base.with_overrides(|name| std::env::var(name).ok()))
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("HHV_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(agent) = lookup("HHV_USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(secs) = lookup("HHV_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = secs;
        }
        if let Some(limit) = lookup("HHV_DISCOVERY_LIMIT").and_then(|v| v.parse().ok()) {
            self.discovery_limit = limit;
        }
        self
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.api_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            between_resolutions: Duration::from_millis(self.resolution_delay_ms),
            between_pages: Duration::from_millis(self.page_delay_ms),
            between_organizations: Duration::from_millis(self.organization_delay_ms),
        }
    }

    pub fn pagination(&self) -> PaginationPolicy {
        PaginationPolicy {
            per_page: self.per_page.max(1),
            max_pages: self.max_pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub working_set: Vec<String>,
    pub used_fallback: bool,
    pub resolved_organizations: usize,
    pub stored_organizations: usize,
    pub fetched_listings: usize,
    pub stored_listings: usize,
}

impl IngestSummary {
    /// Nothing new landed; reports run against whatever the store already holds.
    pub fn is_demo(&self) -> bool {
        self.stored_listings == 0
    }
}

pub struct IngestPipeline<T, S> {
    client: JobBoardClient<T>,
    sink: S,
    discovery_limit: u32,
    fallback: Vec<KnownOrganization>,
}

impl<T: Transport, S: IngestSink> IngestPipeline<T, S> {
    pub fn new(
        client: JobBoardClient<T>,
        sink: S,
        discovery_limit: u32,
        fallback: Vec<KnownOrganization>,
    ) -> Self {
        Self {
            client,
            sink,
            discovery_limit,
            fallback,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn client(&self) -> &JobBoardClient<T> {
        &self.client
    }

    /// Top employers by open vacancies, or the fallback table when discovery
    /// comes back empty. The flag is `true` for the fallback.
    pub async fn working_set(&self) -> (Vec<String>, bool) {
        let discovered = self
            .client
            .discover_top_organizations(self.discovery_limit)
            .await;
        if discovered.is_empty() {
            warn!(count = self.fallback.len(), "discovery found nothing; using fallback organizations");
            let ids = self.fallback.iter().map(|known| known.id.clone()).collect();
            return (ids, true);
        }
        for (rank, organization) in discovered.iter().enumerate() {
            info!(rank = rank + 1, name = %organization.name, id = %organization.id, "discovered organization");
        }
        (discovered.into_iter().map(|o| o.id).collect(), false)
    }

    pub async fn run(&self) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("ingest", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let (working_set, used_fallback) = self.working_set().await;
        let mut summary = IngestSummary {
            run_id,
            started_at,
            finished_at: started_at,
            working_set,
            used_fallback,
            resolved_organizations: 0,
            stored_organizations: 0,
            fetched_listings: 0,
            stored_listings: 0,
        };

        self.sink
            .ensure_schema()
            .await
            .context("preparing database schema")?;

        let organizations = self
            .client
            .resolve_many_organizations(&summary.working_set)
            .await;
        summary.resolved_organizations = organizations.len();
        if organizations.is_empty() {
            warn!("no organizations resolved; skipping listing ingestion");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        for organization in &organizations {
            if self.sink.upsert_organization(organization).await {
                summary.stored_organizations += 1;
                info!(id = %organization.id, name = %organization.name, "organization stored");
            }
        }

        // Listings of an employer that never got a row fail the foreign key
        // and are left out of `stored_listings`.
        let listings = self.client.fetch_all_listings(&summary.working_set).await;
        summary.fetched_listings = listings.total_listings();

        for (organization_id, items) in listings.iter() {
            let mut stored = 0usize;
            for listing in items {
                if self.sink.upsert_listing(listing).await {
                    stored += 1;
                }
            }
            summary.stored_listings += stored;
            info!(organization_id, fetched = items.len(), stored, "listings stored");
        }

        summary.finished_at = Utc::now();
        info!(
            organizations = summary.stored_organizations,
            listings = summary.stored_listings,
            "ingestion finished"
        );
        Ok(summary)
    }
}

pub fn build_store(database: &DatabaseConfig) -> PgStore {
    PgStore::new(ConnectionFactory::from_config(database))
}

pub fn build_pipeline(
    config: &SyncConfig,
    store: PgStore,
) -> Result<IngestPipeline<HttpFetcher, PgStore>> {
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    let client = JobBoardClient::new(fetcher)
        .with_pacing(config.pacing())
        .with_pagination(config.pagination());
    Ok(IngestPipeline::new(
        client,
        store,
        config.discovery_limit,
        config.fallback_organizations.clone(),
    ))
}
