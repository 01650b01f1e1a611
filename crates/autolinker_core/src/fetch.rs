use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use crate::catalog::{Catalog, CatalogEntry};
use crate::config::{AutolinkSettings, clamp_query_limit};

/// One batch of rows returned by the remote page list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogPage {
    pub rows: Vec<CatalogEntry>,
    pub continuation: Option<String>,
}

/// A paginated remote list of `(title, url)` rows.
pub trait CatalogSource {
    /// `false` when no remote endpoint is configured; no request may be sent then.
    fn is_configured(&self) -> bool {
        true
    }
    fn fetch_page(&mut self, limit: usize, continuation: Option<&str>) -> Result<CatalogPage>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub query_limit: usize,
    pub max_titles: usize,
}

impl FetchLimits {
    pub fn new(query_limit: usize, max_titles: usize) -> Self {
        let query_limit = clamp_query_limit(query_limit);
        Self {
            query_limit,
            max_titles: max_titles.max(query_limit),
        }
    }

    pub fn from_settings(settings: &AutolinkSettings) -> Self {
        Self::new(settings.query_limit, settings.max_titles)
    }
}

pub struct RemoteCatalogFetcher<S> {
    source: S,
    limits: FetchLimits,
}

impl<S: CatalogSource> RemoteCatalogFetcher<S> {
    pub fn new(source: S, limits: FetchLimits) -> Self {
        Self { source, limits }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Page through the remote list until the title cap or the last page.
    ///
    /// Never fails: transport errors stop pagination and keep the rows
    /// gathered so far, an unconfigured source yields an empty catalog.
    #[instrument(skip(self), fields(query_limit = self.limits.query_limit, max_titles = self.limits.max_titles))]
    pub fn fetch(&mut self) -> Catalog {
        if !self.source.is_configured() {
            return Catalog::new();
        }

        let FetchLimits {
            query_limit,
            max_titles,
        } = self.limits;
        let mut rows = Vec::new();
        let mut continue_token: Option<String> = None;

        while rows.len() < max_titles {
            let page = match self
                .source
                .fetch_page(query_limit, continue_token.as_deref())
            {
                Ok(page) => page,
                Err(error) => {
                    let message = format!("{error:#}");
                    tracing::warn!(error = %message, collected = rows.len(), "Catalog request failed; keeping partial results");
                    break;
                }
            };
            if page.rows.is_empty() {
                break;
            }

            let room = max_titles - rows.len();
            rows.extend(page.rows.into_iter().take(room));

            continue_token = page.continuation.filter(|token| !token.is_empty());
            if continue_token.is_none() {
                break;
            }
        }

        tracing::debug!(
            rows = rows.len(),
            requests = self.source.request_count(),
            "Catalog fetch finished"
        );
        rows.into_iter().collect()
    }
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub namespace: i32,
}

impl MediaWikiClientConfig {
    pub fn from_settings(settings: &AutolinkSettings) -> Self {
        Self {
            api_url: settings.api_url.clone(),
            user_agent: settings.user_agent.clone(),
            timeout_ms: settings.timeout_ms,
            namespace: settings.namespace,
        }
    }
}

/// Lists pages of another MediaWiki through `generator=allpages` with full URLs.
pub struct MediaWikiCatalogClient {
    client: Client,
    config: MediaWikiClientConfig,
    request_count: usize,
}

impl MediaWikiCatalogClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn request_json(&mut self, api_url: &Url, params: &[(&str, String)]) -> Result<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        self.request_count += 1;
        let response = self
            .client
            .get(api_url.clone())
            .header("User-Agent", self.config.user_agent.clone())
            .query(&pairs)
            .send()
            .context("failed to call MediaWiki API")?;

        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki API request failed with HTTP {status}");
        }

        let payload: Value = response
            .json()
            .context("failed to decode MediaWiki API JSON response")?;
        if let Some(error) = payload.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            let info = error
                .get("info")
                .and_then(Value::as_str)
                .unwrap_or("unknown info");
            bail!("MediaWiki API error [{code}]: {info}");
        }
        Ok(payload)
    }
}

impl CatalogSource for MediaWikiCatalogClient {
    fn is_configured(&self) -> bool {
        self.config
            .api_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    fn fetch_page(&mut self, limit: usize, continuation: Option<&str>) -> Result<CatalogPage> {
        let Some(raw_url) = self.config.api_url.clone() else {
            bail!("no MediaWiki API URL configured");
        };
        let api_url = expand_api_url(&raw_url)?;

        let mut params = vec![
            ("action", "query".to_string()),
            ("generator", "allpages".to_string()),
            ("gapnamespace", self.config.namespace.to_string()),
            ("gaplimit", limit.to_string()),
            ("prop", "info".to_string()),
            ("inprop", "url".to_string()),
        ];
        if let Some(token) = continuation {
            params.push(("gapcontinue", token.to_string()));
        }

        let payload = self.request_json(&api_url, &params)?;
        Ok(parse_catalog_page(payload, &api_url))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Decode one `generator=allpages&prop=info&inprop=url` response.
///
/// A payload that does not have the expected shape is an empty batch.
pub fn parse_catalog_page(payload: Value, api_url: &Url) -> CatalogPage {
    let parsed: QueryResponse = match serde_json::from_value(payload) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::debug!(%error, "Unexpected page list response shape; treating as empty");
            return CatalogPage::default();
        }
    };

    let rows = parsed
        .query
        .pages
        .into_iter()
        .filter_map(|page| {
            let title = page.title.trim().to_string();
            let url = absolute_page_url(page.fullurl.as_deref()?, api_url)?;
            if title.is_empty() {
                return None;
            }
            Some(CatalogEntry { title, url })
        })
        .collect();

    CatalogPage {
        rows,
        continuation: parsed.continuation.and_then(|cont| cont.gapcontinue),
    }
}

fn expand_api_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let candidate = if trimmed.starts_with("//") {
        format!("https:{trimmed}")
    } else if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&candidate).with_context(|| format!("invalid AUTOLINK_API_URL: {raw}"))
}

fn absolute_page_url(raw: &str, api_url: &Url) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("//") {
        return Some(format!("https:{trimmed}"));
    }
    match Url::parse(trimmed) {
        Ok(url) => Some(url.to_string()),
        Err(_) => api_url.join(trimmed).ok().map(|url| url.to_string()),
    }
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageInfoItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    gapcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageInfoItem {
    title: String,
    fullurl: Option<String>,
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use reqwest::Url;
    use serde_json::json;

    use super::{
        CatalogPage, CatalogSource, FetchLimits, MediaWikiCatalogClient, MediaWikiClientConfig,
        RemoteCatalogFetcher, parse_catalog_page,
    };
    use crate::catalog::CatalogEntry;

    /// Serves `pages` batches of `per_page` rows; fails at `fail_at` if set.
    struct MockSource {
        pages: usize,
        per_page: usize,
        fail_at: Option<usize>,
        request_count: usize,
        seen_limits: Vec<usize>,
    }

    impl MockSource {
        fn new(pages: usize, per_page: usize) -> Self {
            Self {
                pages,
                per_page,
                fail_at: None,
                request_count: 0,
                seen_limits: Vec::new(),
            }
        }
    }

    impl CatalogSource for MockSource {
        fn fetch_page(
            &mut self,
            limit: usize,
            continuation: Option<&str>,
        ) -> anyhow::Result<CatalogPage> {
            let index = self.request_count;
            self.request_count += 1;
            self.seen_limits.push(limit);
            if self.fail_at == Some(index) {
                bail!("connection reset");
            }
            let page_number = continuation
                .map(|token| token.parse::<usize>().expect("numeric token"))
                .unwrap_or(0);
            if page_number >= self.pages {
                return Ok(CatalogPage::default());
            }
            let rows = (0..self.per_page)
                .map(|row| {
                    let title = format!("Page {page_number}-{row}");
                    CatalogEntry {
                        url: format!("https://wiki.example.org/{}", title.replace(' ', "_")),
                        title,
                    }
                })
                .collect();
            let next = page_number + 1;
            Ok(CatalogPage {
                rows,
                continuation: (next < self.pages).then(|| next.to_string()),
            })
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    #[test]
    fn pagination_stops_at_title_cap() {
        let mut fetcher = RemoteCatalogFetcher::new(MockSource::new(100, 5), FetchLimits::new(5, 10));
        let catalog = fetcher.fetch();
        assert_eq!(catalog.len(), 10);
        assert!(fetcher.source().request_count() <= 2);
    }

    #[test]
    fn pagination_follows_continuation_to_last_page() {
        let mut fetcher = RemoteCatalogFetcher::new(MockSource::new(3, 4), FetchLimits::new(4, 1000));
        let catalog = fetcher.fetch();
        assert_eq!(catalog.len(), 12);
        assert_eq!(fetcher.source().request_count(), 3);
        assert_eq!(
            catalog.get("Page 2-3"),
            Some("https://wiki.example.org/Page_2-3")
        );
    }

    #[test]
    fn partial_results_survive_a_failed_request() {
        let mut source = MockSource::new(10, 2);
        source.fail_at = Some(2);
        let mut fetcher = RemoteCatalogFetcher::new(source, FetchLimits::new(2, 100));
        let catalog = fetcher.fetch();
        assert_eq!(catalog.len(), 4);
        assert_eq!(fetcher.source().request_count(), 3);
    }

    #[test]
    fn limits_are_clamped_and_cap_never_below_limit() {
        let limits = FetchLimits::new(0, 0);
        assert_eq!(limits.query_limit, 1);
        assert_eq!(limits.max_titles, 1);

        let limits = FetchLimits::new(9_999, 20);
        assert_eq!(limits.query_limit, 5_000);
        assert_eq!(limits.max_titles, 5_000);

        let mut fetcher = RemoteCatalogFetcher::new(MockSource::new(1, 1), FetchLimits::new(0, 0));
        fetcher.fetch();
        assert_eq!(fetcher.source().seen_limits, vec![1]);
    }

    #[test]
    fn unconfigured_client_sends_no_requests() {
        let client = MediaWikiCatalogClient::new(MediaWikiClientConfig {
            api_url: None,
            user_agent: "test".to_string(),
            timeout_ms: 1_000,
            namespace: 0,
        })
        .expect("client");
        let mut fetcher = RemoteCatalogFetcher::new(client, FetchLimits::new(10, 10));
        assert!(fetcher.fetch().is_empty());
        assert_eq!(fetcher.source().request_count(), 0);
    }

    #[test]
    fn parse_catalog_page_reads_rows_and_continuation() {
        let api_url = Url::parse("https://other.example.org/w/api.php").expect("url");
        let page = parse_catalog_page(
            json!({
                "batchcomplete": true,
                "continue": { "gapcontinue": "Gamma", "continue": "gapcontinue||" },
                "query": { "pages": [
                    { "pageid": 1, "ns": 0, "title": "Alpha", "fullurl": "https://other.example.org/wiki/Alpha" },
                    { "pageid": 2, "ns": 0, "title": "Beta", "fullurl": "//other.example.org/wiki/Beta" },
                    { "pageid": 3, "ns": 0, "title": "Delta", "fullurl": "/wiki/Delta" },
                    { "pageid": 4, "ns": 0, "title": "No url" }
                ] }
            }),
            &api_url,
        );
        assert_eq!(page.continuation.as_deref(), Some("Gamma"));
        let urls = page
            .rows
            .iter()
            .map(|row| (row.title.as_str(), row.url.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec![
                ("Alpha", "https://other.example.org/wiki/Alpha"),
                ("Beta", "https://other.example.org/wiki/Beta"),
                ("Delta", "https://other.example.org/wiki/Delta"),
            ]
        );
    }

    #[test]
    fn malformed_payload_is_an_empty_batch() {
        let api_url = Url::parse("https://other.example.org/w/api.php").expect("url");
        let page = parse_catalog_page(json!({ "query": { "pages": "nope" } }), &api_url);
        assert_eq!(page, CatalogPage::default());

        let page = parse_catalog_page(json!({ "batchcomplete": true }), &api_url);
        assert!(page.rows.is_empty());
        assert!(page.continuation.is_none());
    }
}
