//! GoFile adapter.
//!
//! A piece URL looks like `https://gofile.io/d/<id>`. The page behind it is
//! script-driven, so the adapter asks the contents API instead. That API
//! needs two tokens:
//!
//! - a *website token*, scraped from the site's JavaScript bundle (it is
//!   rotated from time to time)
//! - an *account token* for an anonymous account created through the API
//!
//! Both are fetched once and cached for the life of the process, each behind
//! its own async lock so concurrent pieces never fetch them twice. A 401/403
//! from the contents API drops both so the next attempt starts fresh.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, COOKIE, PRAGMA, REFERER};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{PieceStream, SourceAdapter};
use crate::download::client::send_checked;
use crate::download::{FetchError, HttpClient};

static WEBSITE_TOKEN_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"fetchData = \{ wt: "([^"]+)""#).ok());

static SHARED_TOKENS: LazyLock<Arc<TokenCache>> = LazyLock::new(Arc::default);

/// Where the adapter talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoFileEndpoints {
    /// Base of the public site; also sent as `Referer`.
    pub site: String,
    /// Base of the JSON API.
    pub api: String,
    /// JavaScript bundle that carries the website token.
    pub script: String,
}

impl Default for GoFileEndpoints {
    fn default() -> Self {
        Self {
            site: "https://gofile.io".to_string(),
            api: "https://api.gofile.io".to_string(),
            script: "https://gofile.io/dist/js/alljs.js".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct TokenCache {
    website: Mutex<Option<String>>,
    account: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AccountData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ContentsData {
    #[serde(default)]
    children: HashMap<String, Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    link: Option<String>,
}

/// Adapter for `gofile.io` links.
#[derive(Debug, Clone)]
pub struct GoFileSource {
    client: HttpClient,
    endpoints: GoFileEndpoints,
    tokens: Arc<TokenCache>,
}

impl GoFileSource {
    /// Creates the adapter against the public site, sharing the
    /// process-wide token cache.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            endpoints: GoFileEndpoints::default(),
            tokens: Arc::clone(&SHARED_TOKENS),
        }
    }

    /// Creates an adapter against other endpoints with its own token cache.
    #[must_use]
    pub fn with_endpoints(client: HttpClient, endpoints: GoFileEndpoints) -> Self {
        Self {
            client,
            endpoints,
            tokens: Arc::default(),
        }
    }

    async fn website_token(&self) -> Result<String, FetchError> {
        let mut cached = self.tokens.website.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let script_url = &self.endpoints.script;
        let script = self.client.get_text(script_url).await?;
        let token = WEBSITE_TOKEN_RE
            .as_ref()
            .and_then(|re| re.captures(&script))
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| FetchError::protocol(script_url, "could not find website token"))?;

        info!("GoFile website token acquired");
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn account_token(&self) -> Result<String, FetchError> {
        let mut cached = self.tokens.account.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = format!("{}/accounts", self.endpoints.api);
        let response = send_checked(self.client.metadata().post(&url), &url).await?;
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| FetchError::protocol(&url, e.to_string()))?;
        let account: AccountData = serde_json::from_value(envelope.data).map_err(|_| {
            FetchError::protocol(&url, format!("no account token (status {})", envelope.status))
        })?;

        info!("GoFile account token acquired");
        *cached = Some(account.token.clone());
        Ok(account.token)
    }

    async fn invalidate_tokens(&self) {
        warn!("GoFile rejected cached tokens, dropping them");
        *self.tokens.website.lock().await = None;
        *self.tokens.account.lock().await = None;
    }

    async fn resolve_link(&self, piece_url: &str, file_id: &str) -> Result<String, FetchError> {
        let website_token = self.website_token().await?;
        let account_token = self.account_token().await?;

        let contents_url = Url::parse_with_params(
            &format!("{}/contents/{file_id}", self.endpoints.api),
            &[("wt", website_token.as_str())],
        )
        .map_err(|e| FetchError::protocol(piece_url, e.to_string()))?;
        debug!(%piece_url, %contents_url, "resolving");

        let response = self
            .client
            .metadata()
            .get(contents_url.as_str())
            .header(AUTHORIZATION, format!("Bearer {account_token}"))
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(contents_url.as_str(), &e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.invalidate_tokens().await;
            return Err(FetchError::transient(
                contents_url.as_str(),
                format!("token rejected (HTTP {})", status.as_u16()),
            ));
        }
        if !status.is_success() {
            return Err(FetchError::from_status(
                contents_url.as_str(),
                status.as_u16(),
            ));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| FetchError::protocol(piece_url, e.to_string()))?;
        parse_contents(piece_url, envelope)
    }
}

/// Extracts the single child link from a contents response.
fn parse_contents(piece_url: &str, envelope: Envelope) -> Result<String, FetchError> {
    match envelope.status.as_str() {
        "ok" => {}
        "error-notFound" => return Err(FetchError::source_exhausted(piece_url, "not found")),
        other => {
            return Err(FetchError::source_exhausted(
                piece_url,
                format!("unexpected status {other}"),
            ));
        }
    }

    let contents: ContentsData = serde_json::from_value(envelope.data)
        .map_err(|e| FetchError::protocol(piece_url, e.to_string()))?;
    if contents.children.len() != 1 {
        return Err(FetchError::protocol(
            piece_url,
            format!("expected 1 child, got {}", contents.children.len()),
        ));
    }
    contents
        .children
        .into_values()
        .next()
        .and_then(|child| child.link)
        .ok_or_else(|| FetchError::protocol(piece_url, "child has no link"))
}

/// Returns the last path segment of a `/d/<id>` URL.
fn file_id(piece_url: &str) -> Result<String, FetchError> {
    let url = Url::parse(piece_url).map_err(|e| FetchError::protocol(piece_url, e.to_string()))?;
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| FetchError::protocol(piece_url, "no file id in URL"))
}

#[async_trait]
impl SourceAdapter for GoFileSource {
    fn name(&self) -> &str {
        "gofile"
    }

    #[instrument(skip(self))]
    async fn fetch_piece(&self, piece_url: &str) -> Result<PieceStream, FetchError> {
        let file_id = file_id(piece_url)?;
        let link = self.resolve_link(piece_url, &file_id).await?;
        let account_token = self.account_token().await?;
        debug!(%piece_url, %link, "opening stream");

        let request = self
            .client
            .streaming()
            .get(&link)
            .header(COOKIE, format!("accountToken={account_token}"))
            .header(ACCEPT, "*/*")
            .header(REFERER, format!("{}/", self.endpoints.site))
            .header(PRAGMA, "no-cache")
            .header(CACHE_CONTROL, "no-cache");
        self.client.open_stream(request, &link).await
    }
}
