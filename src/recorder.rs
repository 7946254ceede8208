//! Turns match and mismatch events into matchstore writes.

use crate::error::MatchstoreError;
use crate::matcher::MismatchDetail;
use crate::matchstore::{ActualResponse, Match, Matchstore, Mismatch, RecordedRequest};
use crate::request::CapturedRequest;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// Records matches and mismatches against an injected [`Matchstore`].
///
/// In count-only mode no record is built; only the counter moves.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn Matchstore>,
}

impl Recorder {
    pub fn new(store: Arc<dyn Matchstore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Matchstore> {
        &self.store
    }

    /// Record a served request together with the response actually sent.
    ///
    /// Returns the stored record, or `None` in count-only mode.
    pub async fn record_match(
        &self,
        endpoint_id: &str,
        request: &CapturedRequest,
        actual_response: ActualResponse,
    ) -> Result<Option<Match>, MatchstoreError> {
        if self.store.has_matches_count_only() {
            self.store
                .add_matches_count(HashMap::from([(endpoint_id.to_string(), 1)]))
                .await?;
            return Ok(None);
        }

        let record = Match {
            endpoint_id: endpoint_id.to_string(),
            timestamp: Utc::now(),
            request: RecordedRequest::from(request),
            actual_response,
        };
        self.store
            .add_matches(HashMap::from([(endpoint_id.to_string(), vec![record.clone()])]))
            .await?;
        Ok(Some(record))
    }

    /// Record a request that no endpoint accepted.
    pub async fn record_mismatch(
        &self,
        detail: &MismatchDetail,
        request: &CapturedRequest,
    ) -> Result<(), MatchstoreError> {
        if self.store.has_mismatches_count_only() {
            return self.store.add_mismatches_count(1).await;
        }

        self.store
            .add_mismatches(vec![Mismatch {
                timestamp: Utc::now(),
                request: RecordedRequest::from(request),
                detail: detail.to_string(),
            }])
            .await
    }
}
