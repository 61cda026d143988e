//! PostgreSQL persistence: schema bootstrap, idempotent upserts and the
//! aggregate reports read back by the menu.

mod config;

pub use config::{DatabaseConfig, DEFAULT_CONFIG_PATH};

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use hhv_core::{render_salary, CompanyListingCount, Listing, ListingReport, Organization, RankedListing};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Connection, Row};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "hhv-store";

const MAINTENANCE_DATABASE: &str = "postgres";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("reading config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Opens one fresh connection per logical operation. No pooling.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    options: PgConnectOptions,
}

impl ConnectionFactory {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.connect_options())
    }

    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgConnectOptions::from_str(url)?))
    }

    /// Same server and credentials, different database.
    pub fn with_database(&self, database: &str) -> Self {
        Self::new(self.options.clone().database(database))
    }

    pub fn database_name(&self) -> &str {
        self.options.get_database().unwrap_or(MAINTENANCE_DATABASE)
    }

    pub async fn open(&self) -> Result<PgConnection, StoreError> {
        let conn = PgConnection::connect_with(&self.options).await?;
        debug!(database = self.database_name(), "connection opened");
        Ok(conn)
    }

    async fn open_maintenance(&self) -> Result<PgConnection, StoreError> {
        let options = self.options.clone().database(MAINTENANCE_DATABASE);
        Ok(PgConnection::connect_with(&options).await?)
    }

    /// Closes a connection; a failed close is logged, never raised.
    pub async fn release(&self, conn: PgConnection) {
        match conn.close().await {
            Ok(()) => debug!(database = self.database_name(), "connection closed"),
            Err(err) => warn!(error = %err, "closing connection failed"),
        }
    }
}

/// Write side of the store, used by ingestion.
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Creates the database and tables when missing. Safe on every startup.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert-or-update keyed on the organization id. `true` when committed.
    async fn upsert_organization(&self, organization: &Organization) -> bool;

    /// Insert-or-update keyed on the listing id. `true` when committed;
    /// `false` for any database error, including an unknown owning organization.
    async fn upsert_listing(&self, listing: &Listing) -> bool;
}

/// Read side of the store. Failures are logged and read as empty.
#[async_trait]
pub trait ListingReader: Send + Sync {
    async fn companies_and_listing_counts(&self) -> Vec<CompanyListingCount>;
    async fn all_listings(&self) -> Vec<ListingReport>;
    async fn average_salary(&self) -> f64;
    async fn listings_above_average(&self) -> Vec<ListingReport>;
    async fn listings_with_keyword(&self, keyword: &str) -> Vec<ListingReport>;
    async fn top_listings_by_salary(&self, limit: u32) -> Vec<RankedListing>;
}

const CREATE_EMPLOYERS_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS employers (
        employer_id    TEXT PRIMARY KEY,
        name           TEXT NOT NULL,
        url            TEXT,
        description    TEXT,
        open_vacancies INTEGER NOT NULL DEFAULT 0
    )
"#;

const CREATE_VACANCIES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS vacancies (
        vacancy_id     TEXT PRIMARY KEY,
        employer_id    TEXT NOT NULL REFERENCES employers(employer_id),
        title          TEXT NOT NULL,
        salary_from    BIGINT,
        salary_to      BIGINT,
        currency       VARCHAR(10),
        url            TEXT,
        requirement    TEXT,
        responsibility TEXT,
        published_at   TIMESTAMPTZ
    )
"#;

const UPSERT_EMPLOYER_SQL: &str = r#"
    INSERT INTO employers (employer_id, name, url, description, open_vacancies)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (employer_id) DO UPDATE SET
        name = EXCLUDED.name,
        url = EXCLUDED.url,
        description = EXCLUDED.description,
        open_vacancies = EXCLUDED.open_vacancies
"#;

const UPSERT_VACANCY_SQL: &str = r#"
    INSERT INTO vacancies (
        vacancy_id, employer_id, title, salary_from, salary_to,
        currency, url, requirement, responsibility, published_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (vacancy_id) DO UPDATE SET
        employer_id = EXCLUDED.employer_id,
        title = EXCLUDED.title,
        salary_from = EXCLUDED.salary_from,
        salary_to = EXCLUDED.salary_to,
        currency = EXCLUDED.currency,
        url = EXCLUDED.url,
        requirement = EXCLUDED.requirement,
        responsibility = EXCLUDED.responsibility,
        published_at = EXCLUDED.published_at
"#;

// Midpoint of a row's salary, a missing bound counting as zero.
// Each bound is widened before the sum so no row can overflow BIGINT.
const MIDPOINT_SQL: &str = "((COALESCE(v.salary_from, 0)::DOUBLE PRECISION \
     + COALESCE(v.salary_to, 0)::DOUBLE PRECISION) / 2)";

const HAS_SALARY_SQL: &str = "(v.salary_from IS NOT NULL OR v.salary_to IS NOT NULL)";

const COMPANY_COUNTS_SQL: &str = r#"
    SELECT e.name AS company, COUNT(v.vacancy_id) AS listings
      FROM employers e
      LEFT JOIN vacancies v ON e.employer_id = v.employer_id
     GROUP BY e.employer_id, e.name
     ORDER BY listings DESC, e.name
"#;

const LISTING_COLUMNS_SQL: &str = r#"
    SELECT e.name AS company,
           v.title,
           v.salary_from,
           v.salary_to,
           v.currency,
           v.url
      FROM vacancies v
      JOIN employers e ON v.employer_id = e.employer_id
"#;

fn average_sql() -> String {
    format!(
        "SELECT COALESCE(AVG({MIDPOINT_SQL}), 0) AS average FROM vacancies v WHERE {HAS_SALARY_SQL}"
    )
}

fn all_listings_sql() -> String {
    format!("{LISTING_COLUMNS_SQL} ORDER BY e.name, v.title")
}

fn above_average_sql() -> String {
    format!(
        "{LISTING_COLUMNS_SQL} WHERE {MIDPOINT_SQL} > ({}) ORDER BY {MIDPOINT_SQL} DESC, e.name, v.title",
        average_sql()
    )
}

fn keyword_sql() -> String {
    format!("{LISTING_COLUMNS_SQL} WHERE STRPOS(LOWER(v.title), LOWER($1)) > 0 ORDER BY e.name, v.title")
}

fn top_by_salary_sql() -> String {
    let columns = LISTING_COLUMNS_SQL.replacen("v.url", &format!("v.url, {MIDPOINT_SQL} AS midpoint"), 1);
    format!("{columns} WHERE {HAS_SALARY_SQL} ORDER BY midpoint DESC, e.name, v.title LIMIT $1")
}

/// Quotes an identifier for statements that cannot take bind parameters.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn listing_report_from_row(row: &PgRow) -> Result<ListingReport, sqlx::Error> {
    let currency: Option<String> = row.try_get("currency")?;
    Ok(ListingReport {
        company: row.try_get("company")?,
        title: row.try_get("title")?,
        salary: render_salary(
            row.try_get("salary_from")?,
            row.try_get("salary_to")?,
            currency.as_deref(),
        ),
        url: row.try_get("url")?,
    })
}

/// Collapses a failed operation into its empty value after logging it.
fn or_logged<T: Default>(operation: &str, result: Result<T, StoreError>) -> T {
    result.unwrap_or_else(|err| {
        error!(operation, error = %err, "store read failed");
        T::default()
    })
}

/// Writer and reader capabilities over a single [`ConnectionFactory`].
#[derive(Debug, Clone)]
pub struct PgStore {
    connections: ConnectionFactory,
}

impl PgStore {
    pub fn new(connections: ConnectionFactory) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &ConnectionFactory {
        &self.connections
    }

    async fn create_database_if_missing(&self) -> Result<(), StoreError> {
        let name = self.connections.database_name().to_string();
        let mut conn = self.connections.open_maintenance().await?;
        let outcome: Result<(), StoreError> = async {
            let exists = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
                .bind(&name)
                .fetch_optional(&mut conn)
                .await?
                .is_some();
            if exists {
                debug!(database = %name, "database already exists");
            } else {
                sqlx::query(&format!("CREATE DATABASE {}", quote_identifier(&name)))
                    .execute(&mut conn)
                    .await?;
                info!(database = %name, "database created");
            }
            Ok(())
        }
        .await;
        self.connections.release(conn).await;
        outcome
    }

    async fn create_tables(&self) -> Result<(), StoreError> {
        let mut conn = self.connections.open().await?;
        let outcome: Result<(), StoreError> = async {
            let mut tx = conn.begin().await?;
            for statement in [CREATE_EMPLOYERS_SQL, CREATE_VACANCIES_SQL] {
                if let Err(err) = sqlx::query(statement).execute(&mut *tx).await {
                    rollback(tx).await;
                    return Err(err.into());
                }
            }
            tx.commit().await?;
            Ok(())
        }
        .await;
        self.connections.release(conn).await;
        outcome
    }

    /// Runs one parameterised write in its own transaction and connection.
    async fn execute_write<'q>(
        &self,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), StoreError> {
        let mut conn = self.connections.open().await?;
        let outcome: Result<(), StoreError> = async {
            let mut tx = conn.begin().await?;
            match query.execute(&mut *tx).await {
                Ok(_) => {
                    tx.commit().await?;
                    Ok(())
                }
                Err(err) => {
                    rollback(tx).await;
                    Err(StoreError::from(err))
                }
            }
        }
        .await;
        self.connections.release(conn).await;
        outcome
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        bind: Option<Bind<'_>>,
    ) -> Result<Vec<PgRow>, StoreError> {
        let mut conn = self.connections.open().await?;
        let query = sqlx::query(sql);
        let query = match bind {
            Some(Bind::Text(text)) => query.bind(text),
            Some(Bind::Int(value)) => query.bind(value),
            None => query,
        };
        let rows = query.fetch_all(&mut conn).await;
        self.connections.release(conn).await;
        Ok(rows?)
    }

    async fn fetch_reports(&self, sql: &str, bind: Option<Bind<'_>>) -> Result<Vec<ListingReport>, StoreError> {
        let rows = self.fetch_rows(sql, bind).await?;
        Ok(rows.iter().map(listing_report_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn try_average_salary(&self) -> Result<f64, StoreError> {
        let mut conn = self.connections.open().await?;
        let average = sqlx::query_scalar::<_, f64>(&average_sql())
            .fetch_one(&mut conn)
            .await;
        self.connections.release(conn).await;
        Ok(round_cents(average?))
    }

    async fn try_company_counts(&self) -> Result<Vec<CompanyListingCount>, StoreError> {
        let rows = self.fetch_rows(COMPANY_COUNTS_SQL, None).await?;
        let counts = rows
            .iter()
            .map(|row| {
                Ok(CompanyListingCount {
                    company: row.try_get("company")?,
                    listings: row.try_get("listings")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(counts)
    }

    async fn try_top_by_salary(&self, limit: u32) -> Result<Vec<RankedListing>, StoreError> {
        let rows = self
            .fetch_rows(&top_by_salary_sql(), Some(Bind::Int(i64::from(limit))))
            .await?;
        let ranked = rows
            .iter()
            .map(|row| {
                Ok(RankedListing {
                    listing: listing_report_from_row(row)?,
                    midpoint: row.try_get("midpoint")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(ranked)
    }
}

enum Bind<'a> {
    Text(&'a str),
    Int(i64),
}

async fn rollback(tx: sqlx::Transaction<'_, sqlx::Postgres>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "rollback failed");
    }
}

#[async_trait]
impl IngestSink for PgStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.create_database_if_missing().await?;
        self.create_tables().await?;
        info!(database = self.connections.database_name(), "schema ready");
        Ok(())
    }

    async fn upsert_organization(&self, organization: &Organization) -> bool {
        let query = sqlx::query(UPSERT_EMPLOYER_SQL)
            .bind(&organization.id)
            .bind(&organization.name)
            .bind(&organization.url)
            .bind(&organization.description)
            .bind(organization.open_listings);
        match self.execute_write(query).await {
            Ok(()) => true,
            Err(err) => {
                error!(organization_id = %organization.id, error = %err, "organization upsert rolled back");
                false
            }
        }
    }

    async fn upsert_listing(&self, listing: &Listing) -> bool {
        let query = sqlx::query(UPSERT_VACANCY_SQL)
            .bind(&listing.id)
            .bind(&listing.organization_id)
            .bind(&listing.title)
            .bind(listing.salary_from())
            .bind(listing.salary_to())
            .bind(listing.currency())
            .bind(&listing.url)
            .bind(&listing.requirement)
            .bind(&listing.responsibility)
            .bind(listing.published_at);
        match self.execute_write(query).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    listing_id = %listing.id,
                    organization_id = %listing.organization_id,
                    error = %err,
                    "listing upsert rolled back"
                );
                false
            }
        }
    }
}

#[async_trait]
impl ListingReader for PgStore {
    async fn companies_and_listing_counts(&self) -> Vec<CompanyListingCount> {
        or_logged("companies_and_listing_counts", self.try_company_counts().await)
    }

    async fn all_listings(&self) -> Vec<ListingReport> {
        or_logged("all_listings", self.fetch_reports(&all_listings_sql(), None).await)
    }

    async fn average_salary(&self) -> f64 {
        or_logged("average_salary", self.try_average_salary().await)
    }

    async fn listings_above_average(&self) -> Vec<ListingReport> {
        or_logged(
            "listings_above_average",
            self.fetch_reports(&above_average_sql(), None).await,
        )
    }

    async fn listings_with_keyword(&self, keyword: &str) -> Vec<ListingReport> {
        or_logged(
            "listings_with_keyword",
            self.fetch_reports(&keyword_sql(), Some(Bind::Text(keyword))).await,
        )
    }

    async fn top_listings_by_salary(&self, limit: u32) -> Vec<RankedListing> {
        or_logged("top_listings_by_salary", self.try_top_by_salary(limit).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("hh_vacancies"), "\"hh_vacancies\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn average_is_rounded_to_cents() {
        assert_eq!(round_cents(87.5), 87.5);
        assert_eq!(round_cents(1.0 / 3.0), 0.33);
    }

    #[test]
    fn midpoint_widens_each_bound_before_adding() {
        assert!(MIDPOINT_SQL.contains("COALESCE(v.salary_from, 0)::DOUBLE PRECISION"));
        assert!(MIDPOINT_SQL.contains("COALESCE(v.salary_to, 0)::DOUBLE PRECISION"));
    }

    #[test]
    fn top_query_selects_midpoint_and_limit() {
        let sql = top_by_salary_sql();
        assert!(sql.contains("AS midpoint"));
        assert!(sql.contains("LIMIT $1"));
        assert!(sql.contains(HAS_SALARY_SQL));
    }

    #[test]
    fn above_average_uses_the_average_subquery() {
        let sql = above_average_sql();
        assert!(sql.contains(&average_sql()));
        assert!(sql.contains(&format!("ORDER BY {MIDPOINT_SQL} DESC")));
    }

    #[test]
    fn factory_reports_target_database() {
        let factory =
            ConnectionFactory::from_url("postgres://user:pw@localhost:5432/harvest").unwrap();
        assert_eq!(factory.database_name(), "harvest");
        assert_eq!(factory.with_database("other").database_name(), "other");
    }

    #[test]
    fn failed_reads_fall_back_to_empty() {
        let rows: Vec<ListingReport> = or_logged(
            "test",
            Err(StoreError::Database(sqlx::Error::RowNotFound)),
        );
        assert!(rows.is_empty());
        assert_eq!(or_logged::<f64>("test", Err(StoreError::Database(sqlx::Error::PoolClosed))), 0.0);
    }
}
