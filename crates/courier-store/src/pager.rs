//! Cursor-following query runner.

use crate::backend::{Backend, QueryRequest};
use crate::error::Result;
use crate::item::Item;

/// What a multi-request operation does when one of its requests fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop, discard partial results and return the first error.
    Abort,
    /// Log the failure and return whatever was gathered. Callers must not
    /// assume the result is complete.
    LogAndContinue,
}

/// Run `request`, following continuation cursors until `quota` items have
/// been gathered or the range is exhausted.
///
/// With a quota, each re-issued page asks only for the remaining count. A
/// failure on the first page always propagates since nothing was gathered.
pub async fn collect_pages(
    backend: &dyn Backend,
    mut request: QueryRequest,
    quota: Option<usize>,
    policy: FailurePolicy,
) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    let mut first = true;

    loop {
        if let Some(quota) = quota {
            request.limit = Some(quota - items.len());
        }

        let page = match backend.query(&request).await {
            Ok(page) => page,
            Err(e) if policy == FailurePolicy::LogAndContinue && !first => {
                tracing::warn!(
                    table = %request.table,
                    gathered = items.len(),
                    error = %e,
                    "query page failed, returning partial results"
                );
                break;
            }
            Err(e) => return Err(e),
        };
        first = false;

        items.extend(page.items);
        if let Some(quota) = quota {
            if items.len() >= quota {
                items.truncate(quota);
                break;
            }
        }

        match page.last_evaluated_key {
            Some(key) => request.exclusive_start_key = Some(key),
            None => break,
        }
    }

    Ok(items)
}
