//! Match history storage.
//!
//! [`Matchstore`] is the contract the recorder writes to. Backends must accept
//! concurrent writes from many in-flight requests and own retention.
//! [`InMemoryMatchstore`] keeps a bounded FIFO per endpoint for matches and a
//! bounded FIFO for mismatches; counts are never evicted.

use crate::error::MatchstoreError;
use crate::request::CapturedRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Request attributes kept with a match or mismatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub host: Option<String>,
    pub headers: HashMap<String, String>,
}

impl From<&CapturedRequest> for RecordedRequest {
    fn from(req: &CapturedRequest) -> Self {
        Self {
            method: req.method.clone(),
            url: req.url.clone(),
            host: req.host.clone(),
            headers: req.flat_headers(),
        }
    }
}

/// What was actually sent back for a matched request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActualResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// A request that was served by an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    pub endpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub request: RecordedRequest,
    pub actual_response: ActualResponse,
}

/// A request that no endpoint accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mismatch {
    pub timestamp: DateTime<Utc>,
    pub request: RecordedRequest,
    pub detail: String,
}

/// Pluggable store of match and mismatch history.
#[async_trait]
pub trait Matchstore: Send + Sync {
    /// Whether matches are only counted.
    fn has_matches_count_only(&self) -> bool;

    /// Whether mismatches are only counted.
    fn has_mismatches_count_only(&self) -> bool;

    async fn add_matches(&self, matches: HashMap<String, Vec<Match>>) -> Result<(), MatchstoreError>;

    async fn add_matches_count(&self, counts: HashMap<String, i64>) -> Result<(), MatchstoreError>;

    async fn get_matches(&self, endpoint_id: &str) -> Result<Vec<Match>, MatchstoreError>;

    async fn get_matches_count(&self, endpoint_id: &str) -> Result<i64, MatchstoreError>;

    async fn add_mismatches(&self, mismatches: Vec<Mismatch>) -> Result<(), MatchstoreError>;

    async fn add_mismatches_count(&self, count: i64) -> Result<(), MatchstoreError>;

    async fn get_mismatches(&self) -> Result<Vec<Mismatch>, MatchstoreError>;

    async fn get_mismatches_count(&self) -> Result<i64, MatchstoreError>;

    async fn delete_matches(&self) -> Result<(), MatchstoreError>;

    async fn delete_mismatches(&self) -> Result<(), MatchstoreError>;
}

/// Bounds and modes for [`InMemoryMatchstore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchstoreOptions {
    pub matches_count_only: bool,
    pub mismatches_count_only: bool,
    /// Matches kept per endpoint id, 0 for no limit
    pub max_matches_per_endpoint: usize,
    /// Mismatches kept, 0 for no limit
    pub max_mismatches: usize,
}

impl Default for MatchstoreOptions {
    fn default() -> Self {
        Self {
            matches_count_only: false,
            mismatches_count_only: false,
            max_matches_per_endpoint: 100,
            max_mismatches: 100,
        }
    }
}

#[derive(Debug, Default)]
struct MatchState {
    records: HashMap<String, VecDeque<Match>>,
    counts: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct MismatchState {
    records: VecDeque<Mismatch>,
    count: i64,
}

/// In-memory matchstore with oldest-first eviction.
#[derive(Debug, Default)]
pub struct InMemoryMatchstore {
    options: MatchstoreOptions,
    matches: RwLock<MatchState>,
    mismatches: RwLock<MismatchState>,
}

impl InMemoryMatchstore {
    pub fn new(options: MatchstoreOptions) -> Self {
        Self {
            options,
            matches: RwLock::new(MatchState::default()),
            mismatches: RwLock::new(MismatchState::default()),
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    queue.push_back(item);
    if capacity > 0 {
        while queue.len() > capacity {
            queue.pop_front();
        }
    }
}

#[async_trait]
impl Matchstore for InMemoryMatchstore {
    fn has_matches_count_only(&self) -> bool {
        self.options.matches_count_only
    }

    fn has_mismatches_count_only(&self) -> bool {
        self.options.mismatches_count_only
    }

    async fn add_matches(&self, matches: HashMap<String, Vec<Match>>) -> Result<(), MatchstoreError> {
        let mut state = self.matches.write().await;
        for (endpoint_id, records) in matches {
            *state.counts.entry(endpoint_id.clone()).or_default() += records.len() as i64;
            let queue = state.records.entry(endpoint_id).or_default();
            for record in records {
                push_bounded(queue, record, self.options.max_matches_per_endpoint);
            }
        }
        Ok(())
    }

    async fn add_matches_count(&self, counts: HashMap<String, i64>) -> Result<(), MatchstoreError> {
        let mut state = self.matches.write().await;
        for (endpoint_id, count) in counts {
            *state.counts.entry(endpoint_id).or_default() += count;
        }
        Ok(())
    }

    async fn get_matches(&self, endpoint_id: &str) -> Result<Vec<Match>, MatchstoreError> {
        let state = self.matches.read().await;
        Ok(state
            .records
            .get(endpoint_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_matches_count(&self, endpoint_id: &str) -> Result<i64, MatchstoreError> {
        let state = self.matches.read().await;
        Ok(state.counts.get(endpoint_id).copied().unwrap_or(0))
    }

    async fn add_mismatches(&self, mismatches: Vec<Mismatch>) -> Result<(), MatchstoreError> {
        let mut state = self.mismatches.write().await;
        state.count += mismatches.len() as i64;
        for record in mismatches {
            push_bounded(&mut state.records, record, self.options.max_mismatches);
        }
        Ok(())
    }

    async fn add_mismatches_count(&self, count: i64) -> Result<(), MatchstoreError> {
        self.mismatches.write().await.count += count;
        Ok(())
    }

    async fn get_mismatches(&self) -> Result<Vec<Mismatch>, MatchstoreError> {
        Ok(self.mismatches.read().await.records.iter().cloned().collect())
    }

    async fn get_mismatches_count(&self) -> Result<i64, MatchstoreError> {
        Ok(self.mismatches.read().await.count)
    }

    async fn delete_matches(&self) -> Result<(), MatchstoreError> {
        let mut state = self.matches.write().await;
        state.records.clear();
        state.counts.clear();
        Ok(())
    }

    async fn delete_mismatches(&self) -> Result<(), MatchstoreError> {
        let mut state = self.mismatches.write().await;
        state.records.clear();
        state.count = 0;
        Ok(())
    }
}
