use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;

static REPORT_HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"exp\.php\?ID=\d+").unwrap());

/// Only the start of a body is inspected for the block page marker.
const BLOCK_MARKER_WINDOW: usize = 500;
const BLOCK_MARKER: &str = "Blocked";

#[derive(Debug, Error)]
pub enum FetchError {
    /// The site refused us; the current phase should stop.
    #[error("blocked on {url}: {reason}")]
    Blocked { url: String, reason: String },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("request failed for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn is_blocked(&self) -> bool {
        matches!(self, FetchError::Blocked { .. })
    }
}

/// Anything that can turn a URL into a page body.
pub trait PageSource: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// Shared reqwest session; connections are reused across workers.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl PageSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;

        if let Some(reason) = block_reason(status, &body) {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                reason,
            });
        }
        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(body)
    }
}

/// Why a response looks like a denial, if it does.
pub fn block_reason(status: u16, body: &str) -> Option<String> {
    if status == 403 || status == 429 {
        return Some(format!("HTTP {}", status));
    }
    let head = match body.char_indices().nth(BLOCK_MARKER_WINDOW) {
        Some((idx, _)) => &body[..idx],
        None => body,
    };
    if head.contains(BLOCK_MARKER) {
        return Some("block page".to_string());
    }
    None
}

/// Report links on a category page, absolute, distinct, first-seen order.
pub fn report_links(html: &str, site_root: &str, report_base: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").unwrap();

    let mut urls: Vec<String> = Vec::new();
    for element in document.select(&anchors) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !REPORT_HREF_RE.is_match(href) {
            continue;
        }
        let url = resolve_href(href, site_root, report_base);
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

fn resolve_href(href: &str, site_root: &str, report_base: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", site_root.trim_end_matches('/'), href)
    } else {
        format!("{}/{}", report_base.trim_end_matches('/'), href)
    }
}

/// Body text of a report page; falls back to the whole document.
pub fn report_text(html: &str) -> String {
    let document = Html::parse_document(html);
    for css in ["div.report-text", "div#report"] {
        let selector = Selector::parse(css).unwrap();
        if let Some(el) = document.select(&selector).next() {
            return el.text().collect();
        }
    }
    document.root_element().text().collect()
}
