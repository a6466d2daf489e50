//! Where catalog entries come from.

use super::CatalogEntry;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Upper bound on pages fetched per refresh.
const MAX_PAGES: usize = 1_000;

/// A source of catalog entries.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch the complete catalog.
    ///
    /// # Errors
    ///
    /// Returns `Catalog` if the source is unreachable or returns garbage.
    async fn fetch_all(&self) -> Result<Vec<CatalogEntry>>;
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalogSource {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalogSource {
    /// Serve `entries` on every fetch.
    #[must_use]
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    async fn fetch_all(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.entries.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ProductPage {
    #[serde(default)]
    products: Vec<CatalogEntry>,
}

/// Paged product API: `GET {base}/products?limit={page_size}&skip={offset}`.
///
/// Paging stops at the first page shorter than `page_size`.
pub struct HttpCatalogSource {
    base_url: String,
    page_size: usize,
    http_client: reqwest::Client,
}

impl HttpCatalogSource {
    /// Create a source for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the HTTP client cannot be built.
    pub fn new(base_url: &str, page_size: usize, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agentpay-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Catalog HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: page_size.max(1),
            http_client,
        })
    }

    fn page_url(&self, skip: usize) -> String {
        format!(
            "{}/products?limit={}&skip={skip}",
            self.base_url, self.page_size
        )
    }

    async fn fetch_page(&self, skip: usize) -> Result<Vec<CatalogEntry>> {
        let url = self.page_url(skip);
        debug!("Fetching catalog page {url}");

        let page: ProductPage = self
            .http_client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Catalog(format!("GET {url}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Catalog(format!("Malformed page from {url}: {e}")))?;

        Ok(page.products)
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch_all(&self) -> Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();

        for _ in 0..MAX_PAGES {
            let page = self.fetch_page(entries.len()).await?;
            let short = page.len() < self.page_size;
            entries.extend(page);
            if short {
                return Ok(entries);
            }
        }

        Err(Error::Catalog(format!(
            "Catalog at {} exceeded {MAX_PAGES} pages",
            self.base_url
        )))
    }
}
