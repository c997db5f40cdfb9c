use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::fetch::HttpSessionProvider;
use crate::scraper::{ControllerOptions, RetryPolicy};

const CONFIG_FILE: &str = "sdwis";
const ENV_PREFIX: &str = "SDWIS";

#[derive(Clone, Deserialize)]
pub struct Settings {
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub logout_path: Option<String>,
    pub page_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub fetch_timeout_ms: u64,
    pub db_path: PathBuf,
    #[serde(default)]
    pub max_pages: Option<u64>,
    pub max_stalled_pages: u32,
    #[serde(default)]
    pub replay_dir: Option<PathBuf>,
    /// Regexes on the cursor/name field; matching records are not written.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Per-dataset results page overrides.
    #[serde(default)]
    pub page_urls: HashMap<String, String>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("page_size", &self.page_size)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("fetch_timeout_ms", &self.fetch_timeout_ms)
            .field("db_path", &self.db_path)
            .field("max_pages", &self.max_pages)
            .field("max_stalled_pages", &self.max_stalled_pages)
            .field("replay_dir", &self.replay_dir)
            .field("exclude", &self.exclude)
            .finish_non_exhaustive()
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>> {
    Ok(Config::builder()
        .set_default("base_url", "http://sdwis:8080/SDWIS/")?
        .set_default("page_size", 1000)?
        .set_default("max_retries", 3)?
        .set_default("retry_delay_ms", 2000)?
        .set_default("fetch_timeout_ms", 30_000)?
        .set_default("db_path", "data/sdwis.sqlite")?
        .set_default("max_stalled_pages", 2)?)
}

impl Settings {
    /// Defaults, then `sdwis.toml` if present, then `SDWIS_*` variables.
    pub fn load() -> Result<Self> {
        let settings: Settings = defaults()?
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("exclude"),
            )
            .build()
            .context("loading settings")?
            .try_deserialize()
            .context("reading settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            bail!("page_size must be positive");
        }
        if self.base_url.trim().is_empty() {
            bail!("base_url is empty");
        }
        Ok(())
    }

    /// Credentials are only needed when talking to a live server.
    pub fn session_provider(&self) -> Result<HttpSessionProvider> {
        if self.username.is_empty() || self.password.is_empty() {
            bail!("SDWIS_USERNAME and SDWIS_PASSWORD are required for live extraction");
        }
        Ok(HttpSessionProvider {
            base_url: self.base_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            logout_path: self.logout_path.clone(),
            timeout: Duration::from_millis(self.fetch_timeout_ms),
        })
    }

    pub fn controller_options(&self, expected_total: Option<u64>) -> ControllerOptions {
        ControllerOptions {
            page_size: self.page_size,
            retry: RetryPolicy {
                max_attempts: self.max_retries + 1,
                base_backoff: Duration::from_millis(self.retry_delay_ms),
                fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            },
            expected_total,
            max_pages: self.max_pages,
            max_stalled_pages: self.max_stalled_pages,
        }
    }
}
