use std::future::Future;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ExtractError, TransportError};
use crate::parser::datasets::Pagination;
use crate::parser::{DatasetSpec, RawRow};

static VALUES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\bvalues\s*=\s*(\[.*?\])\s*;").unwrap());
static ROWS_RESULTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)name\s*=\s*["']?ROWS_RESULTED1["']?[^>]*?value\s*=\s*["']?(\d+)"#).unwrap()
});

/// Position of the page to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub index: u64,
    pub offset: u64,
    pub page_size: usize,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PageResult {
    pub rows: Vec<RawRow>,
    pub is_last_page: bool,
    /// Total row count announced by the source, when the page carries one.
    pub total_rows: Option<u64>,
}

/// Returns the raw rows of one result page. Implementations own their session.
#[async_trait]
pub trait PageFetcher: Send {
    async fn fetch_page(&mut self, request: &PageRequest) -> Result<PageResult, TransportError>;
}

/// Hands out authenticated sessions and takes them back.
#[async_trait]
pub trait SessionProvider: Sync {
    type Session: Send;

    async fn acquire(&self) -> Result<Self::Session, TransportError>;
    async fn release(&self, session: Self::Session) -> Result<(), TransportError>;
}

/// Acquire a session, run `f` with exclusive ownership of it, and release it on
/// every exit path. `f` hands the session back alongside its result.
pub async fn with_session<P, T, F, Fut>(provider: &P, f: F) -> Result<T, ExtractError>
where
    P: SessionProvider,
    F: FnOnce(P::Session) -> Fut,
    Fut: Future<Output = (P::Session, Result<T, ExtractError>)>,
{
    let session = provider.acquire().await.map_err(ExtractError::Session)?;
    info!("Session acquired");
    let (session, result) = f(session).await;
    match provider.release(session).await {
        Ok(()) => info!("Session released"),
        Err(e) => warn!("Session release failed: {}", e),
    }
    result
}

// ── Row decoding ──

/// Decode a `values`-style array: one entry per row, each cell either a bare
/// value or a one-element array holding it.
pub fn rows_from_values(spec: &DatasetSpec, values: &[Value]) -> Result<Vec<RawRow>, TransportError> {
    values
        .iter()
        .map(|row| {
            let cells = row
                .as_array()
                .ok_or_else(|| TransportError::Malformed(format!("row is not an array: {row}")))?;
            let texts: Vec<String> = cells.iter().map(cell_text).collect();
            Ok(spec.row_from_cells(&texts))
        })
        .collect()
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::Array(items) => items.first().map(cell_text).unwrap_or_default(),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Pull the embedded `values = [...]` array and the `ROWS_RESULTED1` count
/// out of a results frame.
pub fn parse_results_frame(spec: &DatasetSpec, body: &str) -> Result<(Vec<RawRow>, Option<u64>), TransportError> {
    let total = ROWS_RESULTED_RE
        .captures(body)
        .and_then(|c| c[1].parse::<u64>().ok());
    let Some(caps) = VALUES_RE.captures(body) else {
        return Err(TransportError::Malformed("no values array in results frame".to_string()));
    };
    let values: Vec<Value> = serde_json::from_str(&caps[1])
        .map_err(|e| TransportError::Malformed(format!("values array: {e}")))?;
    Ok((rows_from_values(spec, &values)?, total))
}

// ── HTTP session ──

#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Clone)]
pub struct HttpSessionProvider {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub logout_path: Option<String>,
    pub timeout: Duration,
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    type Session = HttpSession;

    async fn acquire(&self) -> Result<HttpSession, TransportError> {
        let base = if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        };
        let base_url = Url::parse(&base).map_err(|e| TransportError::Session(format!("bad base url: {e}")))?;
        let client = Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .build()?;

        let login_url = base_url
            .join("jsp/secure/")
            .map_err(|e| TransportError::Session(e.to_string()))?;
        info!("Logging in at {}", login_url);
        client
            .post(login_url)
            .form(&[("j_username", self.username.as_str()), ("j_password", self.password.as_str())])
            .send()
            .await?
            .error_for_status()?;

        // A rejected login bounces protected pages back to the login form.
        let probe = base_url
            .join("ibsmain_tc.jsp")
            .map_err(|e| TransportError::Session(e.to_string()))?;
        let response = client.get(probe).send().await?.error_for_status()?;
        if response.url().as_str().to_ascii_lowercase().contains("login") {
            return Err(TransportError::Session("credentials rejected".to_string()));
        }

        Ok(HttpSession { client, base_url })
    }

    async fn release(&self, session: HttpSession) -> Result<(), TransportError> {
        if let Some(path) = &self.logout_path {
            let url = session
                .base_url
                .join(path)
                .map_err(|e| TransportError::Session(e.to_string()))?;
            session.client.get(url).send().await?;
        }
        Ok(())
    }
}

/// Fetches results frames over an authenticated HTTP session.
pub struct HttpPageFetcher {
    session: HttpSession,
    spec: &'static DatasetSpec,
    page_url: String,
}

impl HttpPageFetcher {
    pub fn new(session: HttpSession, spec: &'static DatasetSpec, page_url: Option<String>) -> Self {
        Self {
            session,
            spec,
            page_url: page_url.unwrap_or_else(|| spec.page_url.to_string()),
        }
    }

    fn url_for(&self, request: &PageRequest) -> Result<Url, TransportError> {
        let path = self
            .page_url
            .replace("{offset}", &request.offset.to_string())
            .replace("{page}", &request.index.to_string())
            .replace("{size}", &request.page_size.to_string());
        let mut url = self
            .session
            .base_url
            .join(&path)
            .map_err(|e| TransportError::Malformed(format!("page url {path}: {e}")))?;
        if let (Pagination::Cursor { param, .. }, Some(cursor)) = (self.spec.pagination, &request.cursor) {
            url.query_pairs_mut().append_pair(param, cursor);
        }
        Ok(url)
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&mut self, request: &PageRequest) -> Result<PageResult, TransportError> {
        let url = self.url_for(request)?;
        debug!("GET {}", url);
        let response = self.session.client.get(url).send().await?.error_for_status()?;
        if response.url().as_str().to_ascii_lowercase().contains("login") {
            return Err(TransportError::Session("session expired".to_string()));
        }
        let body = response.text().await?;
        let (rows, total_rows) = parse_results_frame(self.spec, &body)?;
        Ok(PageResult {
            rows,
            is_last_page: false,
            total_rows,
        })
    }
}

// ── Replay ──

#[derive(Debug, Deserialize)]
struct CapturedPage {
    rows: Vec<Value>,
    #[serde(default)]
    is_last_page: bool,
    total_rows: Option<u64>,
}

/// Serves pages captured from a live session, `page_0000.json` onwards.
/// A missing file ends the trace.
pub struct ReplayFetcher {
    dir: PathBuf,
    spec: &'static DatasetSpec,
}

impl ReplayFetcher {
    pub fn new(dir: impl Into<PathBuf>, spec: &'static DatasetSpec) -> Self {
        Self { dir: dir.into(), spec }
    }
}

#[async_trait]
impl PageFetcher for ReplayFetcher {
    async fn fetch_page(&mut self, request: &PageRequest) -> Result<PageResult, TransportError> {
        let path = self.dir.join(format!("page_{:04}.json", request.index));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No capture at {}, end of trace", path.display());
                return Ok(PageResult {
                    is_last_page: true,
                    ..PageResult::default()
                });
            }
            Err(e) => return Err(e.into()),
        };
        let page: CapturedPage = serde_json::from_str(&text)
            .map_err(|e| TransportError::Malformed(format!("{}: {e}", path.display())))?;
        Ok(PageResult {
            rows: rows_from_values(self.spec, &page.rows)?,
            is_last_page: page.is_last_page,
            total_rows: page.total_rows,
        })
    }
}
