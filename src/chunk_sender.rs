#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use crate::chunk::Chunk;
use crate::status::Status;

/// This is the abstraction for handing an outbound chunk to the transport. Sending is
///  fire-and-forget: it must not block, and a chunk that gets lost on the way is recovered by
///  the protocol like any other lost chunk.
#[cfg_attr(test, automock)]
pub trait ChunkSender: Send + Sync + 'static {
    fn send_chunk(&self, chunk: Chunk);
}

impl ChunkSender for mpsc::UnboundedSender<Chunk> {
    fn send_chunk(&self, chunk: Chunk) {
        trace!("passing chunk to transport: {:?}", chunk);

        if let Err(e) = self.send(chunk) {
            warn!("transport channel closed, dropping {:?}", e.0);
        }
    }
}

/// Notified exactly once when a transfer completes, typically so that the dispatcher can
///  deregister it
#[cfg_attr(test, automock)]
pub trait TransferEndListener: Send + Sync + 'static {
    fn end_transfer(&self, transfer_id: u32, status: Status);
}

impl TransferEndListener for mpsc::UnboundedSender<(u32, Status)> {
    fn end_transfer(&self, transfer_id: u32, status: Status) {
        if self.send((transfer_id, status)).is_err() {
            warn!("end of transfer {} with {} not delivered: listener is gone", transfer_id, status);
        }
    }
}
