//! Per-peer session store for in-flight pairing attempts.
//!
//! The store is the only mutable shared state in the core. Each operation
//! locks the whole map, so get-or-create / replace-code / append / clear are
//! atomic relative to each other for a given peer. Sessions are created on
//! first contact and cleared on completed reassembly, on a superseding code,
//! or on explicit reset.

use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::codec::{self, Fragment, ReassemblyError};

/// In-flight state for one peer.
#[derive(Debug, Default)]
struct Session {
    code: Option<StoredCode>,
    /// Raw byte accumulator for the legacy sentinel scheme.
    accumulator: Vec<u8>,
    /// Index-keyed fragments for the indexed scheme.
    indexed: BTreeMap<u8, Vec<u8>>,
    expected_total: Option<u8>,
}

#[derive(Debug)]
struct StoredCode {
    value: String,
    received_at: Instant,
}

/// Peer-keyed map of [`Session`]s with an explicit lifecycle.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a one-time code for a peer, creating the session if needed.
    ///
    /// A new code supersedes any previous one and clears the stale fragment
    /// accumulator; duplicate code delivery overwrites rather than rejects
    /// (the documented relaxed invariant).
    pub async fn replace_code(&self, peer: &str, code: &str) {
        let mut map = self.inner.lock().await;
        let session = map.entry(peer.to_string()).or_default();
        if session.code.is_some() {
            debug!("superseding stored code for peer {peer}");
        }
        session.code = Some(StoredCode {
            value: code.to_string(),
            received_at: Instant::now(),
        });
        session.accumulator.clear();
        session.indexed.clear();
        session.expected_total = None;
    }

    /// The code currently stored for a peer, if any.
    pub async fn code(&self, peer: &str) -> Option<String> {
        let map = self.inner.lock().await;
        map.get(peer).and_then(|s| s.code.as_ref().map(|c| c.value.clone()))
    }

    /// Whether the stored code is older than the given expiry window.
    ///
    /// Expiry is advisory: the caller decides whether to enforce it on the
    /// accept path.
    pub async fn code_expired(&self, peer: &str, window: Duration) -> bool {
        let map = self.inner.lock().await;
        map.get(peer)
            .and_then(|s| s.code.as_ref())
            .is_some_and(|c| c.received_at.elapsed() > window)
    }

    /// Append raw bytes to the sentinel accumulator and try to slice out a
    /// complete payload.
    ///
    /// On success the accumulator is cleared; the stored code is kept until
    /// explicit reset. While the span is incomplete the accumulator is left
    /// untouched for the next append.
    pub async fn append_and_extract(&self, peer: &str, chunk: &[u8]) -> Option<String> {
        let mut map = self.inner.lock().await;
        let session = map.entry(peer.to_string()).or_default();
        session.accumulator.extend_from_slice(chunk);
        let payload = codec::extract_sentinel(&session.accumulator)?;
        session.accumulator.clear();
        Some(payload)
    }

    /// Insert an indexed fragment; returns the reassembled payload once all
    /// pieces have arrived.
    ///
    /// Storage is order-independent: fragments are keyed by index, and a
    /// duplicate index overwrites its earlier delivery.
    pub async fn insert_indexed(
        &self,
        peer: &str,
        fragment: Fragment,
    ) -> Result<Option<String>, ReassemblyError> {
        let mut map = self.inner.lock().await;
        let session = map.entry(peer.to_string()).or_default();

        match session.expected_total {
            None => session.expected_total = Some(fragment.total),
            Some(total) if total != fragment.total => {
                // a new transfer supersedes a half-finished one
                debug!(
                    "fragment total changed from {total} to {} for peer {peer}, restarting",
                    fragment.total
                );
                session.indexed.clear();
                session.expected_total = Some(fragment.total);
            }
            Some(_) => {}
        }

        session.indexed.insert(fragment.index, fragment.to_bytes());

        let total = session.expected_total.unwrap_or(0) as usize;
        if session.indexed.len() < total {
            return Ok(None);
        }

        let frames: Vec<Vec<u8>> = session.indexed.values().cloned().collect();
        let payload = codec::reassemble(&frames)?;
        session.indexed.clear();
        session.expected_total = None;
        Ok(Some(payload))
    }

    /// Drop all in-flight state for a peer.
    pub async fn reset(&self, peer: &str) {
        let mut map = self.inner.lock().await;
        map.remove(peer);
    }

    /// Number of peers with live sessions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
