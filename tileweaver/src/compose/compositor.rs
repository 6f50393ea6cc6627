//! Merging single-layer tiles into one multi-layer tile.
//!
//! Single-layer tiles for the contributing collections are produced by
//! independently scheduled requests, so at merge time some of them may
//! not have reached the store yet. The compositor bridges that race by
//! polling: up to [`RetryPolicy::max_attempts`] passes over the
//! outstanding collections, separated by the policy's pause, cancellable
//! between passes. A contribution that never materializes leaves the
//! result marked incomplete rather than failing the merge; incomplete
//! results must not be written back to the store.
//!
//! Corrupt cache entries are the exception: bytes that fail to decode
//! are evicted and the merge fails loudly, naming the tile address.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::cache::{TileStore, TileStoreError};
use crate::compose::codec::{decode_tile, CodecError, MultiLayerTileBuilder};
use crate::retry::RetryPolicy;
use crate::tile::{TileAddress, TileMatrixSet};

/// Errors that abort a merge.
///
/// A contribution that is merely missing is not an error; the merge
/// completes with `is_complete = false` instead.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// Cached bytes failed to decode as a vector tile. The entry has
    /// been evicted (best effort) by the time this is returned.
    #[error("corrupt tile entry at {address}")]
    Corrupt {
        address: TileAddress,
        #[source]
        source: CodecError,
    },

    /// The store kept failing for a contribution through the whole
    /// attempt budget.
    #[error(transparent)]
    Store(#[from] TileStoreError),
}

/// One collection's contribution to a merge.
#[derive(Debug, Clone)]
pub struct LayerSource {
    /// Where the single-layer tile lives in the store.
    pub address: TileAddress,
    /// Bytes already fetched by the caller, if any. When unset, the
    /// compositor reads the store itself on every attempt.
    pub payload: Option<Bytes>,
}

impl LayerSource {
    /// A contribution to be read from the store.
    pub fn cached(address: TileAddress) -> Self {
        Self {
            address,
            payload: None,
        }
    }

    /// A contribution whose bytes the caller already holds.
    pub fn prefetched(address: TileAddress, payload: Bytes) -> Self {
        Self {
            address,
            payload: Some(payload),
        }
    }
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedTile {
    /// The encoded multi-layer tile, holding whatever contributions
    /// were merged. Zero-length when nothing contributed features.
    pub bytes: Bytes,
    /// Whether every requested collection was accounted for. Callers
    /// must not cache the bytes when this is false.
    pub is_complete: bool,
}

/// Per-collection bookkeeping inside one merge invocation.
#[derive(Debug)]
struct PendingSource {
    address: TileAddress,
    payload: Option<Bytes>,
    /// The store error from the most recent attempt, cleared whenever
    /// an attempt reaches the store cleanly.
    last_error: Option<TileStoreError>,
}

/// Merges per-collection single-layer tiles from a [`TileStore`].
pub struct TileCompositor {
    store: Arc<dyn TileStore>,
    retry: RetryPolicy,
}

impl TileCompositor {
    /// Creates a compositor with the standard merge retry policy.
    pub fn new(store: Arc<dyn TileStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::merge_default(),
        }
    }

    /// Replaces the retry policy. Tests inject a zero-delay policy
    /// here; `RetryPolicy::None` turns retrying off entirely.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Merges the given contributions into one multi-layer tile.
    ///
    /// Each attempt walks the collections not yet accounted for, in
    /// name order: provided or freshly read bytes are decoded and
    /// folded into the accumulator under their layer names; a
    /// zero-length payload or a positive empty-marker check counts the
    /// collection as a legitimately empty contribution. Collections
    /// still outstanding when the attempt budget runs out, or when
    /// `cancellation` fires between attempts, leave the result
    /// incomplete.
    ///
    /// # Arguments
    ///
    /// * `matrix` - The tiling scheme, supplying the coordinate extent
    ///   for layers whose source did not carry one.
    /// * `sources` - Contributing collections by id.
    /// * `cancellation` - Checked between attempts; an attempt that has
    ///   started always finishes.
    ///
    /// # Returns
    ///
    /// The merged tile, or an error on corruption or a store failure
    /// that persisted through the final attempt.
    #[instrument(skip_all, fields(matrix = %matrix.id(), collections = sources.len()))]
    pub async fn merge(
        &self,
        matrix: &TileMatrixSet,
        sources: BTreeMap<String, LayerSource>,
        cancellation: CancellationToken,
    ) -> Result<MergedTile, ComposeError> {
        let requested = sources.len();
        let mut accumulator = MultiLayerTileBuilder::new(matrix.tile_extent());
        let mut remaining: BTreeMap<String, PendingSource> = sources
            .into_iter()
            .map(|(collection, source)| {
                (
                    collection,
                    PendingSource {
                        address: source.address,
                        payload: source.payload,
                        last_error: None,
                    },
                )
            })
            .collect();

        let mut cancelled = false;
        let mut attempt = 0;
        while !remaining.is_empty() {
            attempt += 1;
            self.run_attempt(&mut accumulator, &mut remaining, attempt)
                .await?;
            if remaining.is_empty() {
                break;
            }

            let Some(delay) = self.retry.delay_for_attempt(attempt) else {
                break;
            };
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if remaining.is_empty() {
            debug!(
                collections = requested,
                attempts = attempt,
                layers = accumulator.layer_count(),
                "Merge complete"
            );
            return Ok(MergedTile {
                bytes: accumulator.into_bytes(),
                is_complete: true,
            });
        }

        // A store that was still failing on the final attempt is a
        // backend problem, not a generation race; propagate it. After
        // cancellation the caller is walking away, so the partial
        // result wins either way.
        if !cancelled {
            let persistent = remaining
                .iter_mut()
                .find_map(|(_, pending)| pending.last_error.take());
            if let Some(store_error) = persistent {
                return Err(ComposeError::Store(store_error));
            }
        }

        let missing: Vec<&String> = remaining.keys().collect();
        warn!(
            ?missing,
            cancelled,
            attempts = attempt,
            "Merge incomplete"
        );
        Ok(MergedTile {
            bytes: accumulator.into_bytes(),
            is_complete: false,
        })
    }

    /// One pass over the outstanding collections.
    async fn run_attempt(
        &self,
        accumulator: &mut MultiLayerTileBuilder,
        remaining: &mut BTreeMap<String, PendingSource>,
        attempt: u32,
    ) -> Result<(), ComposeError> {
        let outstanding: Vec<String> = remaining.keys().cloned().collect();
        for collection in outstanding {
            let Some(pending) = remaining.get_mut(&collection) else {
                continue;
            };
            let address = pending.address.clone();

            let bytes = match pending.payload.take() {
                Some(payload) => Some(payload),
                None => match self.store.read(&address).await {
                    Ok(found) => {
                        pending.last_error = None;
                        found
                    }
                    Err(read_error) => {
                        warn!(
                            collection = %collection,
                            tile = %address,
                            attempt,
                            error = %read_error,
                            "Store read failed, treating tile as not yet present"
                        );
                        pending.last_error = Some(read_error);
                        continue;
                    }
                },
            };

            match bytes {
                Some(payload) if !payload.is_empty() => match decode_tile(&payload) {
                    Ok(features) => {
                        let merged = features.len();
                        for feature in features {
                            accumulator.add_feature(feature);
                        }
                        debug!(
                            collection = %collection,
                            tile = %address,
                            features = merged,
                            "Contribution merged"
                        );
                        remaining.remove(&collection);
                    }
                    Err(source) => {
                        error!(
                            collection = %collection,
                            tile = %address,
                            error = %source,
                            "Corrupt cache entry, evicting"
                        );
                        if let Err(evict_error) = self.store.delete(&address).await {
                            warn!(
                                tile = %address,
                                error = %evict_error,
                                "Failed to evict corrupt entry"
                            );
                        }
                        return Err(ComposeError::Corrupt { address, source });
                    }
                },
                Some(_) => {
                    // Zero-length payload is the empty-tile marker.
                    debug!(collection = %collection, "Empty contribution");
                    remaining.remove(&collection);
                }
                None => match self.store.is_empty(&address).await {
                    Ok(Some(true)) => {
                        debug!(collection = %collection, "Empty contribution");
                        remaining.remove(&collection);
                    }
                    Ok(_) => {}
                    Err(check_error) => {
                        warn!(
                            collection = %collection,
                            tile = %address,
                            attempt,
                            error = %check_error,
                            "Store unreachable during empty-marker check"
                        );
                    }
                },
            }
        }

        Ok(())
    }
}
