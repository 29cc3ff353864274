//! Collaborator seam for the game-server query protocol
//!
//! The wire protocol itself lives outside the engine; the poller only
//! depends on these three sub-queries, each bounded by its own timeout.

use async_trait::async_trait;
use shared::{Metadata, PlayerEntry, RawRules, TargetAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Client for the remote server query protocol.
///
/// Implementations are expected to cancel the underlying request once the
/// given timeout elapses and report it as [`QueryError::Timeout`].
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query_info(&self, addr: &TargetAddr, timeout: Duration)
        -> Result<Metadata, QueryError>;

    async fn query_players(
        &self,
        addr: &TargetAddr,
        timeout: Duration,
    ) -> Result<Vec<PlayerEntry>, QueryError>;

    async fn query_rules(&self, addr: &TargetAddr, timeout: Duration)
        -> Result<RawRules, QueryError>;
}
