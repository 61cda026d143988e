use std::path::{Path, PathBuf};

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

use crate::StoreError;

pub const DEFAULT_CONFIG_PATH: &str = "config/database.yaml";

/// Connection parameters for the PostgreSQL store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct DatabaseConfigFile {
    postgresql: DatabaseConfig,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: "hh_vacancies".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

impl DatabaseConfig {
    /// Parses the `postgresql:` section of a YAML config document.
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str::<DatabaseConfigFile>(text).map(|file| file.postgresql)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| StoreError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text).map_err(|source| StoreError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File values when the file exists, built-in defaults otherwise, then
    /// `HHV_DB_*` environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, StoreError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let base = if path.exists() {
            Self::from_yaml_file(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no database config file; using defaults");
            Self::default()
        };
        Ok(base.with_overrides(|name| std::env::var(name).ok()))
    }

    /// Applies `HHV_DB_HOST`, `HHV_DB_PORT`, `HHV_DB_NAME`, `HHV_DB_USER` and
    /// `HHV_DB_PASSWORD` as looked up by `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("HHV_DB_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("HHV_DB_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(database) = lookup("HHV_DB_NAME") {
            self.database = database;
        }
        if let Some(user) = lookup("HHV_DB_USER") {
            self.user = user;
        }
        if let Some(password) = lookup("HHV_DB_PASSWORD") {
            self.password = password;
        }
        self
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user);
        if self.password.is_empty() {
            options
        } else {
            options.password(&self.password)
        }
    }
}
