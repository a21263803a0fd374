use std::time::Duration;
use anyhow::bail;
use crate::chunk::ProtocolVersion;

/// Timeouts and retry budgets shared by both transfer directions.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// This is how long a transfer waits for the peer's next chunk once the exchange is under way.
    ///  Every inbound chunk re-arms the timer with this value.
    pub response_timeout: Duration,

    /// This is the timeout for the very first response after `begin()`. It is typically longer
    ///  than `response_timeout` since the peer may have to look up (or open) the resource before
    ///  it can answer.
    pub initial_response_timeout: Duration,

    /// Consecutive timeouts without any inbound chunk before the transfer gives up. Any inbound
    ///  chunk resets this count.
    pub max_retries: u32,

    /// Total number of timeouts over the whole lifetime of a transfer. This bounds transfers that
    ///  make some progress on every retry but never finish.
    pub max_lifetime_retries: u32,

    /// The protocol version the client asks for. The effective version is negotiated during the
    ///  handshake, and [ProtocolVersion::LEGACY] skips the handshake altogether.
    pub protocol_version: ProtocolVersion,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            response_timeout: Duration::from_secs(2),
            initial_response_timeout: Duration::from_secs(4),
            max_retries: 3,
            max_lifetime_retries: 1500,
            protocol_version: ProtocolVersion::LATEST,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.response_timeout.is_zero() {
            bail!("response timeout must be positive");
        }
        if self.initial_response_timeout.is_zero() {
            bail!("initial response timeout must be positive");
        }
        if self.max_lifetime_retries < self.max_retries {
            bail!("lifetime retries ({}) must be at least the number of retries ({})", self.max_lifetime_retries, self.max_retries);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReadTransferConfig {
    /// the size of the receive window the client grants the peer
    pub max_bytes_to_receive: u64,
    pub max_chunk_size: u32,
    /// pacing delay the peer is asked to insert between data chunks
    pub chunk_delay: Option<Duration>,

    /// The window is extended proactively once the part of it that was not received yet shrinks
    ///  to `max_bytes_to_receive / extend_window_divisor` or less, so the peer does not have to
    ///  stall waiting for parameters.
    pub extend_window_divisor: u64,
}

impl Default for ReadTransferConfig {
    fn default() -> Self {
        ReadTransferConfig {
            max_bytes_to_receive: 8192,
            max_chunk_size: 1024,
            chunk_delay: None,
            extend_window_divisor: 2,
        }
    }
}

impl ReadTransferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_bytes_to_receive == 0 {
            bail!("receive window must not be empty");
        }
        if self.max_chunk_size == 0 {
            bail!("max chunk size must be positive");
        }
        if self.extend_window_divisor == 0 {
            bail!("window extension divisor must be positive");
        }
        Ok(())
    }

    pub(crate) fn extend_window_threshold(&self) -> u64 {
        self.max_bytes_to_receive / self.extend_window_divisor
    }

    pub(crate) fn chunk_delay_micros(&self) -> Option<u32> {
        self.chunk_delay
            .map(|d| u32::try_from(d.as_micros()).unwrap_or(u32::MAX))
    }
}
