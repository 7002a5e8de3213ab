//! Collaborator traits for the two ends of the byte stream: the local data source the sender
//!  pulls from, and the consumer the receiver delivers to. Both are non-blocking - "nothing
//!  available" and backpressure are expressed as return values, never by suspending the
//!  caller indefinitely.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Result of pulling from a [DataSource]. An explicit three-way outcome instead of overloading
///  a numeric return: a byte count can not also mean 'not ready' or 'exhausted'.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// up to the requested number of bytes, at least one
    Chunk(Vec<u8>),
    /// nothing available right now - try again on a later event
    NotReady,
    /// the source has permanently run dry; this drives the EOF handshake
    Exhausted,
}

/// The local origin of outbound stream data.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// Pull up to `max_len` bytes. Must not block waiting for data - return
    ///  [ReadOutcome::NotReady] instead.
    async fn read_chunk(&self, max_len: usize) -> ReadOutcome;
}

/// The local sink for inbound stream data.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamConsumer: Send + Sync + 'static {
    /// The number of bytes the consumer is currently willing to accept. Delivery attempts are
    ///  bounded by this, so `accept` is never offered more than the consumer asked for.
    async fn available_space(&self) -> usize;

    /// Hand over in-order stream bytes. Returns the number of bytes actually accepted, which
    ///  may be less than offered (backpressure). An `Err` is fatal to the session.
    async fn accept(&self, data: &[u8]) -> anyhow::Result<usize>;

    /// Signal the clean end of the inbound stream. Called exactly once per session, when the
    ///  EOF marker is accepted. An `Err` is fatal to the session.
    async fn on_end_of_stream(&self) -> anyhow::Result<()>;
}
