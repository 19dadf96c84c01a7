//! Reassembly of chunked agent responses
//!
//! Fragments are keyed by `(session, request)` so two chunked replies in flight
//! on the same session assemble independently. Fragments for one key arrive in
//! send order because each session has exactly one reader.

use dashmap::DashMap;
use std::collections::HashMap;
use tarmoq_proto::{ForwardResponse, ResponseKind};
use tracing::{debug, trace};

use crate::session::SessionId;

type ChunkKey = (SessionId, String);

struct Accumulator {
    body: String,
    chunk_count: usize,
    status: u16,
    headers: HashMap<String, String>,
    complete: bool,
}

pub struct ChunkBuffer {
    accumulators: DashMap<ChunkKey, Accumulator>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self {
            accumulators: DashMap::new(),
        }
    }

    /// Append a fragment. Status comes from the first fragment; headers from all
    /// fragments are merged. Returns the number of fragments seen so far.
    pub fn add(&self, session_id: &str, chunk: &ForwardResponse) -> usize {
        let key = (session_id.to_string(), chunk.request_id.clone());
        let mut acc = self.accumulators.entry(key).or_insert_with(|| Accumulator {
            body: String::new(),
            chunk_count: 0,
            status: chunk.status,
            headers: HashMap::new(),
            complete: false,
        });

        acc.body.push_str(&chunk.body);
        acc.chunk_count += 1;
        acc.headers
            .extend(chunk.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        acc.complete |= chunk.last;

        trace!(
            "Chunk {} for request {} on session {} ({} bytes so far)",
            acc.chunk_count,
            chunk.request_id,
            session_id,
            acc.body.len()
        );
        acc.chunk_count
    }

    /// Take the assembled response once its terminal fragment has arrived
    pub fn take_complete(&self, session_id: &str, request_id: &str) -> Option<ForwardResponse> {
        let key = (session_id.to_string(), request_id.to_string());
        let (_, acc) = self.accumulators.remove_if(&key, |_, acc| acc.complete)?;

        debug!(
            "Reassembled request {} from {} chunk(s)",
            request_id, acc.chunk_count
        );
        Some(ForwardResponse {
            request_id: request_id.to_string(),
            status: acc.status,
            body: acc.body,
            headers: acc.headers,
            last: true,
            kind: ResponseKind::Normal,
        })
    }

    /// Drop every accumulator belonging to a session
    pub fn clear_session(&self, session_id: &str) -> usize {
        let before = self.accumulators.len();
        self.accumulators.retain(|(session, _), _| session != session_id);
        before.saturating_sub(self.accumulators.len())
    }

    /// Drop one request's accumulator, if any
    pub fn discard(&self, session_id: &str, request_id: &str) -> bool {
        let key = (session_id.to_string(), request_id.to_string());
        self.accumulators.remove(&key).is_some()
    }

    /// Keep only the session's accumulators whose request `keep` accepts
    pub fn retain_session<F>(&self, session_id: &str, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let before = self.accumulators.len();
        self.accumulators
            .retain(|(session, request), _| session != session_id || keep(request));
        before.saturating_sub(self.accumulators.len())
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new()
    }
}
