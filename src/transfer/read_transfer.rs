use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, trace};
use crate::chunk::{Chunk, ChunkType};
use crate::config::ReadTransferConfig;
use crate::status::Status;
use super::{DataChunkOutcome, TransferCore, TransferDirection, TransferState};

/// Downloads a resource from the peer into an internal buffer.
///
/// The read side drives flow control: it grants the peer a window of `max_bytes_to_receive`
///  starting at the next expected offset, and requests a new window (or extends the current one)
///  as data arrives. Data arriving out of order is never buffered. Instead the reader enters
///  RECOVERY and asks the peer to resume at the expected offset.
pub(crate) struct ReadTransfer {
    config: ReadTransferConfig,
    data: BytesMut,
    /// the next offset expected from the peer
    offset: u64,
    window_end_offset: u64,
    remaining_transfer_size: Option<u64>,
    /// offset of the most recent data chunk, used in RECOVERY to tell a repeated chunk (meaning
    ///  the retransmit request got lost) from stale chunks still in flight
    last_chunk_offset: Option<u64>,
}

impl ReadTransfer {
    pub fn new(config: ReadTransferConfig) -> ReadTransfer {
        ReadTransfer {
            config,
            data: BytesMut::new(),
            offset: 0,
            window_end_offset: 0,
            remaining_transfer_size: None,
            last_chunk_offset: None,
        }
    }

    /// grants a new window starting at the current offset
    fn apply_transfer_parameters(&mut self, chunk: &mut Chunk) {
        self.window_end_offset = self.offset + self.config.max_bytes_to_receive;

        chunk.offset = self.offset;
        chunk.window_end_offset = Some(self.window_end_offset);
        chunk.max_chunk_size_bytes = Some(self.config.max_chunk_size);
        chunk.min_delay_microseconds = self.config.chunk_delay_micros();
    }

    fn send_transfer_parameters(&mut self, core: &mut TransferCore, chunk_type: ChunkType) {
        let mut chunk = core.new_chunk(chunk_type);
        self.apply_transfer_parameters(&mut chunk);
        core.send_chunk(chunk);
    }

    fn update_remaining_transfer_size(&mut self, chunk: &Chunk) {
        match chunk.remaining_bytes {
            Some(remaining) => self.remaining_transfer_size = Some(remaining),
            None => {
                // a local estimate that hits zero without a final chunk was wrong
                self.remaining_transfer_size = self.remaining_transfer_size
                    .and_then(|r| r.checked_sub(chunk.data.len() as u64))
                    .filter(|&r| r > 0);
            }
        }
    }
}

impl TransferDirection for ReadTransfer {
    fn set_initial_chunk_fields(&mut self, chunk: &mut Chunk) {
        self.apply_transfer_parameters(chunk);
    }

    fn handle_data_chunk(&mut self, core: &mut TransferCore, chunk: &Chunk) -> DataChunkOutcome {
        if chunk.chunk_type != ChunkType::Data {
            debug!("transfer {}: ignoring {:?} while reading", core.id(), chunk);
            return DataChunkOutcome::Pending;
        }

        if core.state() == TransferState::Recovery {
            if chunk.offset != self.offset {
                if self.last_chunk_offset == Some(chunk.offset) {
                    debug!("transfer {}: received chunk at offset {} again, re-requesting data from offset {}", core.id(), chunk.offset, self.offset);
                    self.send_transfer_parameters(core, ChunkType::ParametersRetransmit);
                }
                else {
                    trace!("transfer {}: ignoring chunk at offset {} while waiting for offset {}", core.id(), chunk.offset, self.offset);
                    self.last_chunk_offset = Some(chunk.offset);
                }
                return DataChunkOutcome::Pending;
            }

            info!("transfer {}: recovered, peer resumed at offset {}", core.id(), self.offset);
            core.set_state(TransferState::Waiting);
        }

        if chunk.offset != self.offset {
            debug!("transfer {}: expected data at offset {}, received offset {} - entering recovery", core.id(), self.offset, chunk.offset);
            core.set_state(TransferState::Recovery);
            self.last_chunk_offset = Some(chunk.offset);
            self.send_transfer_parameters(core, ChunkType::ParametersRetransmit);
            return DataChunkOutcome::Pending;
        }

        let chunk_end = chunk.offset + chunk.data.len() as u64;
        if chunk_end > self.window_end_offset {
            error!("transfer {}: peer sent data up to offset {} beyond the window ending at {}", core.id(), chunk_end, self.window_end_offset);
            return DataChunkOutcome::Terminate(Status::Internal);
        }

        self.data.extend_from_slice(&chunk.data);
        self.offset = chunk_end;
        self.last_chunk_offset = Some(chunk.offset);

        if chunk.remaining_bytes == Some(0) {
            debug!("transfer {}: received final chunk, {} bytes in total", core.id(), self.offset);
            return DataChunkOutcome::Terminate(Status::Ok);
        }

        self.update_remaining_transfer_size(chunk);
        core.update_progress(self.offset, self.offset, self.remaining_transfer_size.map(|r| r + self.offset));

        if let Some(window_end_offset) = chunk.window_end_offset.filter(|&w| w != 0) {
            if window_end_offset < self.offset {
                error!("transfer {}: peer announced window end {} behind offset {}", core.id(), window_end_offset, self.offset);
                return DataChunkOutcome::Terminate(Status::Internal);
            }
            if window_end_offset > self.window_end_offset {
                error!("transfer {}: peer announced window end {} beyond the granted window end {}", core.id(), window_end_offset, self.window_end_offset);
                return DataChunkOutcome::Terminate(Status::Internal);
            }
            self.window_end_offset = window_end_offset;
        }

        let remaining_window_size = self.window_end_offset - self.offset;
        if remaining_window_size == 0 {
            trace!("transfer {}: window exhausted at offset {}", core.id(), self.offset);
            self.send_transfer_parameters(core, ChunkType::ParametersRetransmit);
        }
        else if remaining_window_size <= self.config.extend_window_threshold() {
            trace!("transfer {}: extending window at offset {}", core.id(), self.offset);
            self.send_transfer_parameters(core, ChunkType::ParametersContinue);
        }

        DataChunkOutcome::Pending
    }

    fn retry_after_data_timeout(&mut self, core: &mut TransferCore) {
        if matches!(core.state(), TransferState::Waiting | TransferState::Recovery) {
            self.send_transfer_parameters(core, ChunkType::ParametersRetransmit);
        }
    }

    fn data(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    fn completed_len(&self) -> u64 {
        self.offset
    }
}
