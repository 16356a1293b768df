//! Bounded-parallelism fan-out over backend-sized chunks.
//!
//! Sub-requests run concurrently on the calling task. Under
//! [`FailurePolicy::Abort`] the first error drops the stream, which cancels
//! every sibling still in flight; the call never returns while a
//! sub-request it started is still running.

use std::collections::HashSet;
use std::future::Future;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::backend::{describe_key, Backend, WriteRequest};
use crate::error::{Result, StoreError};
use crate::item::Item;
use crate::pager::FailurePolicy;
use crate::schema::{MAX_BATCH_GET_ITEMS, MAX_BATCH_WRITE_ITEMS};

/// Rounds of unprocessed-key resubmission before a chunk gives up.
pub const MAX_UNPROCESSED_ROUNDS: usize = 16;

/// Run `f` over every input with at most `parallelism` in flight. Results
/// come back in completion order.
pub async fn fan_out<I, T, F, Fut>(
    inputs: I,
    parallelism: usize,
    policy: FailurePolicy,
    f: F,
) -> Result<Vec<T>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let results = stream::iter(inputs).map(f).buffer_unordered(parallelism.max(1));

    match policy {
        FailurePolicy::Abort => results.try_collect().await,
        FailurePolicy::LogAndContinue => {
            let all: Vec<Result<T>> = results.collect().await;
            let mut ok = Vec::with_capacity(all.len());
            let mut failed = 0usize;
            for result in all {
                match result {
                    Ok(value) => ok.push(value),
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(error = %e, "fan-out request failed, dropping its results");
                    }
                }
            }
            if failed > 0 {
                tracing::debug!(failed, succeeded = ok.len(), "fan-out finished with failures");
            }
            Ok(ok)
        }
    }
}

/// Fetch every key, chunked to the backend batch limit. Duplicate keys are
/// fetched once.
pub async fn batch_get_all(
    backend: &dyn Backend,
    table: &str,
    keys: Vec<Item>,
    projection: Option<&[String]>,
    parallelism: usize,
    policy: FailurePolicy,
) -> Result<Vec<Item>> {
    let mut seen = HashSet::new();
    let keys: Vec<Item> = keys
        .into_iter()
        .filter(|k| seen.insert(describe_key(k)))
        .collect();
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let chunks: Vec<Vec<Item>> = keys
        .chunks(MAX_BATCH_GET_ITEMS)
        .map(<[Item]>::to_vec)
        .collect();

    let pages = fan_out(chunks, parallelism, policy, |chunk| async move {
        get_chunk(backend, table, chunk, projection).await
    })
    .await?;

    Ok(pages.into_iter().flatten().collect())
}

async fn get_chunk(
    backend: &dyn Backend,
    table: &str,
    mut pending: Vec<Item>,
    projection: Option<&[String]>,
) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    for _ in 0..MAX_UNPROCESSED_ROUNDS {
        let out = backend.batch_get(table, pending, projection).await?;
        items.extend(out.items);
        if out.unprocessed.is_empty() {
            return Ok(items);
        }
        pending = out.unprocessed;
    }
    Err(StoreError::Unprocessed {
        table: table.to_string(),
        remaining: pending.len(),
    })
}

/// Apply every request, chunked to the backend batch limit. Always aborts on
/// the first failed chunk. Returns the number of requests applied.
pub async fn batch_write_all(
    backend: &dyn Backend,
    table: &str,
    requests: Vec<WriteRequest>,
    parallelism: usize,
) -> Result<usize> {
    let total = requests.len();
    if total == 0 {
        return Ok(0);
    }

    let chunks: Vec<Vec<WriteRequest>> = requests
        .chunks(MAX_BATCH_WRITE_ITEMS)
        .map(<[WriteRequest]>::to_vec)
        .collect();

    fan_out(chunks, parallelism, FailurePolicy::Abort, |chunk| async move {
        write_chunk(backend, table, chunk).await
    })
    .await?;

    Ok(total)
}

async fn write_chunk(backend: &dyn Backend, table: &str, mut pending: Vec<WriteRequest>) -> Result<()> {
    for _ in 0..MAX_UNPROCESSED_ROUNDS {
        pending = backend.batch_write(table, pending).await?;
        if pending.is_empty() {
            return Ok(());
        }
    }
    Err(StoreError::Unprocessed {
        table: table.to_string(),
        remaining: pending.len(),
    })
}
