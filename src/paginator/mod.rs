//! Drives the transport across listing pages until a short page.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::{build_query, build_url, descriptor, ResourceType, PAGE_SIZE};
use crate::error::{FetchError, FetchResult};
use crate::mapper::RawRecord;
use crate::transport::{ApiRequest, RetryingTransport};

/// Upper bound on pages per listing when the server never sends a short page.
pub const MAX_PAGES: usize = 1000;

/// Records gathered by one `fetch_all` call.
///
/// `failure` is set when a page after the first failed for good; the
/// records before it are kept.
#[derive(Debug)]
pub struct Fetched {
    pub records: Vec<RawRecord>,
    pub failure: Option<FetchError>,
}

impl Fetched {
    fn complete(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            failure: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct Paginator {
    transport: Arc<RetryingTransport>,
    base_url: String,
    max_pages: usize,
}

impl Paginator {
    pub fn new(transport: Arc<RetryingTransport>, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_pages: MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn transport(&self) -> &Arc<RetryingTransport> {
        &self.transport
    }

    /// Fetches every record of `resource` under the given scope and filters.
    ///
    /// Stops on a short page, once `TotalResults` records are in hand, or
    /// after `max_pages` pages. A first-page failure is returned as an
    /// error. A later failure, or hitting the page cap, yields a partial
    /// [`Fetched`].
    pub async fn fetch_all(
        &self,
        resource: ResourceType,
        owner: &str,
        path_params: &HashMap<String, String>,
        filters: &HashMap<String, String>,
    ) -> FetchResult<Fetched> {
        let desc = descriptor(resource);
        let url = build_url(&self.base_url, resource, path_params)?;

        if !desc.supports_pagination {
            let query = build_query(resource, 1, PAGE_SIZE, filters)?;
            let body = self
                .transport
                .request(&ApiRequest::get(&url).query(query).owner(owner))
                .await?;
            let records = extract_records(&body, &[desc.list_key, "entities"])?;
            debug!(resource = %resource, count = records.len(), "Fetched unpaginated listing");
            return Ok(Fetched::complete(records));
        }

        let page_size = desc.page_size.unwrap_or(PAGE_SIZE);
        let mut records = Vec::new();
        let mut start_index = 1;
        let mut pages = 0;

        loop {
            if pages == self.max_pages {
                let cause = FetchError::InvalidResponse(format!(
                    "listing did not end after {} pages",
                    pages
                ));
                warn!(resource = %resource, pages, records = records.len(), "Page limit reached");
                return Ok(Fetched {
                    records,
                    failure: Some(cause),
                });
            }

            let query = build_query(resource, start_index, page_size, filters)?;
            let request = ApiRequest::get(&url).query(query).owner(owner);

            let page = self.transport.request(&request).await.and_then(|body| {
                let total = body.get("TotalResults").and_then(Value::as_u64);
                extract_records(&body, &[desc.list_key]).map(|page| (page, total))
            });

            let (page, total) = match page {
                Ok(page) => page,
                Err(e) if pages == 0 => return Err(e),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => {
                    warn!(
                        resource = %resource,
                        pages,
                        records = records.len(),
                        error = %e,
                        "Pagination stopped early, keeping partial result"
                    );
                    return Ok(Fetched {
                        records,
                        failure: Some(e),
                    });
                }
            };

            pages += 1;
            let page_len = page.len();
            records.extend(page);
            debug!(resource = %resource, start_index, page_len, "Fetched page");

            if page_len < page_size {
                break;
            }
            if total.is_some_and(|total| records.len() as u64 >= total) {
                break;
            }
            start_index += page_size;
        }

        info!(resource = %resource, pages, total = records.len(), "Pagination complete");
        Ok(Fetched::complete(records))
    }
}

/// Reads the record array from the first of `keys` present in `body`.
pub(crate) fn extract_records(body: &Value, keys: &[&str]) -> FetchResult<Vec<RawRecord>> {
    let items = keys
        .iter()
        .find_map(|key| body.get(key).and_then(Value::as_array))
        .ok_or_else(|| {
            FetchError::InvalidResponse(format!("response has none of the keys {:?}", keys))
        })?;

    items.iter().map(RawRecord::from_json).collect()
}
