//! Overlay glue
//!
//! Publishes which HTTP address holds a piece of content under
//! `market/<hex key>`, finds holders again, and turns a list of holders into
//! a ranked stream of storage quotes.

use crate::client::TransferClient;
use futures::stream::{FuturesUnordered, StreamExt};
use orca_core::{ContentKey, PeerAddress, Result, StorageQuote};
use orca_dht::Overlay;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const QUOTE_BUFFER: usize = 16;

/// Overlay key under which holders of `key` are published
pub fn market_key(key: &ContentKey) -> String {
    format!("market/{}", key.to_hex())
}

/// Announce that `http_addr` serves `key`
pub async fn publish_content(overlay: &Overlay, key: &ContentKey, http_addr: &str) -> Result<()> {
    overlay.put_value(&market_key(key), http_addr).await
}

/// Announce every key in `keys`; returns how many were published
///
/// Individual failures are logged and skipped.
pub async fn publish_all(overlay: &Overlay, keys: &[ContentKey], http_addr: &str) -> usize {
    let mut published = 0;
    for key in keys {
        match publish_content(overlay, key, http_addr).await {
            Ok(()) => published += 1,
            Err(e) => tracing::warn!("Failed to publish {}: {}", key, e),
        }
    }
    tracing::info!("Published {}/{} keys as {}", published, keys.len(), http_addr);
    published
}

/// Addresses published for `key` within `wait`
///
/// Values that are not `host:port` are dropped.
pub async fn locate_content(overlay: &Overlay, key: &ContentKey, wait: Duration) -> Vec<PeerAddress> {
    let values = overlay.search_value(&market_key(key)).collect_within(wait).await;

    let mut holders: Vec<PeerAddress> = Vec::new();
    for value in values {
        match value.parse::<PeerAddress>() {
            Ok(addr) if !holders.contains(&addr) => holders.push(addr),
            Ok(_) => {}
            Err(_) => tracing::debug!("Ignoring bad holder address {:?} for {}", value, key),
        }
    }
    tracing::debug!("Found {} holders of {}", holders.len(), key);
    holders
}

/// Ask every holder for a quote, in parallel
///
/// Quotes arrive in completion order. The final one carries
/// `is_last_candidate = true`; holders that fail to answer are skipped.
pub fn collect_quotes(
    client: Arc<TransferClient>,
    key: ContentKey,
    holders: Vec<PeerAddress>,
) -> mpsc::Receiver<StorageQuote> {
    let (tx, rx) = mpsc::channel(QUOTE_BUFFER);

    tokio::spawn(async move {
        let mut pending: FuturesUnordered<_> = holders
            .into_iter()
            .map(|addr| {
                let client = client.clone();
                async move {
                    let result = client.fetch_quote(addr.as_str(), &key).await;
                    (addr, result)
                }
            })
            .collect();

        // Hold one quote back so the last can be flagged
        let mut held: Option<StorageQuote> = None;
        while let Some((addr, result)) = pending.next().await {
            match result {
                Ok(quote) => {
                    if let Some(previous) = held.replace(quote) {
                        if tx.send(previous).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::debug!("No quote from {}: {}", addr, e),
            }
        }

        if let Some(mut last) = held {
            last.is_last_candidate = true;
            let _ = tx.send(last).await;
        }
    });

    rx
}

/// Cheapest quote on `quotes`; ties go to the first seen
///
/// Stops at the quote flagged `is_last_candidate` or when the stream ends.
pub async fn select_quote(mut quotes: mpsc::Receiver<StorageQuote>) -> Option<StorageQuote> {
    let mut best: Option<StorageQuote> = None;
    while let Some(quote) = quotes.recv().await {
        let last = quote.is_last_candidate;
        if best.as_ref().map_or(true, |b| quote.price < b.price) {
            best = Some(quote);
        }
        if last {
            break;
        }
    }
    best
}
