use std::cmp::min;
use std::sync::Weak;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::{task, time};
use tracing::{debug, error, trace, Instrument, Span};
use crate::chunk::{Chunk, ChunkType};
use crate::status::Status;
use super::{DataChunkOutcome, Direction, TransferCore, TransferDirection, TransferInner, TransferState};

/// The outcome of sending one chunk of a window
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum WindowStep {
    /// more data is pending in the window, send it after the given pacing delay
    Continue(Option<Duration>),
    Done,
}

/// Uploads `data` to the peer, in windows granted by the peer's parameters chunks.
pub(crate) struct WriteTransfer {
    data: Bytes,
    offset: u64,
    window_end_offset: u64,
    /// zero until the peer announced it
    max_chunk_size: u32,
    chunk_delay: Option<Duration>,
    /// Incremented for every window the peer grants. A window transmission task that finds a
    ///  different id is stale and ends without sending anything.
    window_id: u32,
    /// the offset up to which the peer confirmed receipt, for progress reporting
    bytes_confirmed_received: u64,
}

impl WriteTransfer {
    pub fn new(data: Bytes) -> WriteTransfer {
        WriteTransfer {
            data,
            offset: 0,
            window_end_offset: 0,
            max_chunk_size: 0,
            chunk_delay: None,
            window_id: 0,
            bytes_confirmed_received: 0,
        }
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn has_pending_data(&self) -> bool {
        self.offset < self.window_end_offset
            || (self.offset == self.len() && self.window_end_offset == self.len())
    }

    fn handle_parameters_update(&mut self, core: &mut TransferCore, chunk: &Chunk) -> Result<(), Status> {
        if chunk.offset > self.len() {
            error!("transfer {}: peer requested offset {} beyond the end of the data ({} bytes)", core.id(), chunk.offset, self.len());
            return Err(Status::OutOfRange);
        }

        let Some(window_end_offset) = chunk.window_end_offset.filter(|&end| end > chunk.offset) else {
            error!("transfer {}: peer granted an empty window ({:?}) at offset {}", core.id(), chunk.window_end_offset, chunk.offset);
            return Err(Status::Internal);
        };

        self.window_end_offset = min(window_end_offset, self.len());

        if chunk.requests_transmission_from_offset() {
            if self.offset != chunk.offset {
                debug!("transfer {}: peer requested data from offset {}, rewinding from {}", core.id(), chunk.offset, self.offset);
            }
            self.offset = chunk.offset;
        }

        if let Some(max_chunk_size) = chunk.max_chunk_size_bytes {
            self.max_chunk_size = max_chunk_size;
        }
        if let Some(delay) = chunk.min_delay() {
            self.chunk_delay = Some(delay);
        }

        if self.max_chunk_size == 0 {
            error!("transfer {}: peer did not announce a max chunk size", core.id());
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    fn next_chunk(&mut self, core: &TransferCore) -> Chunk {
        let len = self.len();
        let size = min(u64::from(self.max_chunk_size), self.window_end_offset.saturating_sub(self.offset));

        let start = self.offset as usize;
        let end = (self.offset + size) as usize;

        let mut chunk = core.new_chunk(ChunkType::Data);
        chunk.offset = self.offset;
        chunk.data = self.data.slice(start..end);
        if len - self.offset <= size {
            chunk.remaining_bytes = Some(0);
        }

        self.offset += size;
        chunk
    }

    fn transmit_next_chunk(&mut self, core: &mut TransferCore, window_id: u32) -> WindowStep {
        if window_id != self.window_id || core.state() != TransferState::Transmitting {
            trace!("transfer {}: window {} is stale, current window is {}", core.id(), window_id, self.window_id);
            return WindowStep::Done;
        }

        if !self.has_pending_data() {
            debug!("transfer {}: window ending at {} has no data to send from offset {}", core.id(), self.window_end_offset, self.offset);
            core.set_state(TransferState::Waiting);
            return WindowStep::Done;
        }

        let chunk = self.next_chunk(core);
        core.send_chunk(chunk);
        core.update_progress(self.offset, self.bytes_confirmed_received, Some(self.len()));

        if self.offset >= self.window_end_offset {
            trace!("transfer {}: window {} sent up to offset {}", core.id(), window_id, self.offset);
            core.set_state(TransferState::Waiting);
            return WindowStep::Done;
        }
        WindowStep::Continue(self.chunk_delay)
    }
}

impl TransferDirection for WriteTransfer {
    fn set_initial_chunk_fields(&mut self, chunk: &mut Chunk) {
        chunk.remaining_bytes = Some(self.len());
    }

    fn handle_data_chunk(&mut self, core: &mut TransferCore, chunk: &Chunk) -> DataChunkOutcome {
        if !matches!(chunk.chunk_type, ChunkType::ParametersRetransmit | ChunkType::ParametersContinue | ChunkType::Start) {
            debug!("transfer {}: ignoring {:?} while writing", core.id(), chunk);
            return DataChunkOutcome::Pending;
        }

        if core.state() == TransferState::Transmitting {
            core.set_state(TransferState::Waiting);
        }

        if let Err(status) = self.handle_parameters_update(core, chunk) {
            return DataChunkOutcome::Terminate(status);
        }

        self.bytes_confirmed_received = chunk.offset;
        core.update_progress(self.offset, self.bytes_confirmed_received, Some(self.len()));
        core.set_state(TransferState::Transmitting);

        self.window_id = self.window_id.wrapping_add(1);
        spawn_window_transmission(core.self_ref(), self.window_id);
        DataChunkOutcome::Pending
    }

    fn retry_after_data_timeout(&mut self, core: &mut TransferCore) {
        if core.state() == TransferState::Waiting {
            core.resend_last_chunk();
        }
    }

    fn data(&self) -> Bytes {
        self.data.clone()
    }

    fn completed_len(&self) -> u64 {
        self.len()
    }
}

/// Sends the window with the given id one chunk at a time, releasing the lock between chunks so
///  that inbound chunks and timeouts are handled while a window is in flight.
fn spawn_window_transmission(transfer: Weak<RwLock<TransferInner>>, window_id: u32) {
    tokio::spawn(async move {
        loop {
            let Some(inner) = transfer.upgrade() else {
                return;
            };

            let step = {
                let mut inner = inner.write().await;
                let TransferInner { core, direction } = &mut *inner;
                match direction {
                    Direction::Write(write) => write.transmit_next_chunk(core, window_id),
                    Direction::Read(_) => WindowStep::Done,
                }
            };
            drop(inner);

            match step {
                WindowStep::Continue(Some(delay)) => time::sleep(delay).await,
                WindowStep::Continue(None) => task::yield_now().await,
                WindowStep::Done => return,
            }
        }
    }.instrument(Span::current()));
}
