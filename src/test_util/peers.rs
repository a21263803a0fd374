//! Scripted server side peers. They react to each client chunk with the chunks a well-behaved
//!  server would send, and rely on the client's retries for anything lost on the way.

use std::cmp::min;
use bytes::{Bytes, BytesMut};
use tracing::trace;
use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::status::Status;

pub trait FakePeer {
    fn on_client_chunk(&mut self, chunk: &Chunk) -> Vec<Chunk>;
}

fn peer_chunk(version: ProtocolVersion, session_id: u32, chunk_type: ChunkType) -> Chunk {
    Chunk {
        session_id: Some(session_id),
        ..Chunk::new(version, chunk_type)
    }
}

/// Serves a resource to a reading client
pub struct ServingPeer {
    version: ProtocolVersion,
    session_id: u32,
    resource: Bytes,
    offset: u64,
    window_end_offset: u64,
    max_chunk_size: u64,
    /// the terminating status the client reported
    pub client_status: Option<Status>,
}

impl ServingPeer {
    /// For [ProtocolVersion::LEGACY] the session id must be the resource id
    pub fn new(version: ProtocolVersion, session_id: u32, resource: Bytes) -> ServingPeer {
        ServingPeer {
            version,
            session_id,
            resource,
            offset: 0,
            window_end_offset: 0,
            max_chunk_size: 0,
            client_status: None,
        }
    }

    fn apply_parameters(&mut self, chunk: &Chunk, rewind: bool) {
        if rewind {
            self.offset = chunk.offset;
        }
        self.window_end_offset = chunk.window_end_offset.unwrap_or(chunk.offset);
        if let Some(max_chunk_size) = chunk.max_chunk_size_bytes {
            self.max_chunk_size = max_chunk_size.into();
        }
    }

    fn send_window(&mut self) -> Vec<Chunk> {
        let len = self.resource.len() as u64;

        let mut result = Vec::new();
        while self.offset < min(self.window_end_offset, len) && self.max_chunk_size > 0 {
            let end = min(self.offset + self.max_chunk_size, min(self.window_end_offset, len));

            let mut chunk = peer_chunk(self.version, self.session_id, ChunkType::Data);
            chunk.offset = self.offset;
            chunk.data = self.resource.slice(self.offset as usize..end as usize);
            chunk.remaining_bytes = Some(len - end);
            result.push(chunk);

            self.offset = end;
        }

        if result.is_empty() && self.offset == len {
            // the final chunk got lost, and the client asked for it again
            let mut chunk = peer_chunk(self.version, self.session_id, ChunkType::Data);
            chunk.offset = self.offset;
            chunk.remaining_bytes = Some(0);
            result.push(chunk);
        }
        result
    }
}

impl FakePeer for ServingPeer {
    fn on_client_chunk(&mut self, chunk: &Chunk) -> Vec<Chunk> {
        trace!("serving peer: received {:?}", chunk);

        match chunk.chunk_type {
            ChunkType::Start if self.version.requires_completion_ack() => {
                vec![peer_chunk(self.version, self.session_id, ChunkType::StartAck)]
            }
            ChunkType::Start | ChunkType::StartAckConfirmation | ChunkType::ParametersRetransmit => {
                self.apply_parameters(chunk, true);
                self.send_window()
            }
            ChunkType::ParametersContinue => {
                self.apply_parameters(chunk, false);
                self.send_window()
            }
            ChunkType::Completion => {
                self.client_status = chunk.status;
                if self.version.requires_completion_ack() {
                    vec![peer_chunk(self.version, self.session_id, ChunkType::CompletionAck)]
                }
                else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }
}

/// Receives a resource from a writing client
pub struct ReceivingPeer {
    version: ProtocolVersion,
    session_id: u32,
    window_size: u64,
    max_chunk_size: u32,
    received: BytesMut,
    window_end_offset: u64,
    /// offset of the most recent out-of-order chunk while recovering
    recovery_offset: Option<u64>,
    complete: bool,
    /// the terminating status the client reported, if it aborted
    pub client_status: Option<Status>,
}

impl ReceivingPeer {
    /// For [ProtocolVersion::LEGACY] the session id must be the resource id
    pub fn new(version: ProtocolVersion, session_id: u32, window_size: u64, max_chunk_size: u32) -> ReceivingPeer {
        ReceivingPeer {
            version,
            session_id,
            window_size,
            max_chunk_size,
            received: BytesMut::new(),
            window_end_offset: 0,
            recovery_offset: None,
            complete: false,
            client_status: None,
        }
    }

    pub fn received(&self) -> Bytes {
        Bytes::copy_from_slice(&self.received)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn offset(&self) -> u64 {
        self.received.len() as u64
    }

    fn request_window(&mut self) -> Chunk {
        self.window_end_offset = self.offset() + self.window_size;

        let mut chunk = peer_chunk(self.version, self.session_id, ChunkType::ParametersRetransmit);
        chunk.offset = self.offset();
        chunk.window_end_offset = Some(self.window_end_offset);
        chunk.max_chunk_size_bytes = Some(self.max_chunk_size);
        chunk
    }

    fn completion(&self) -> Chunk {
        Chunk {
            status: Some(Status::Ok),
            ..peer_chunk(self.version, self.session_id, ChunkType::Completion)
        }
    }

    fn on_data(&mut self, chunk: &Chunk) -> Vec<Chunk> {
        if self.complete {
            // our completion got lost
            return vec![self.completion()];
        }

        if chunk.offset != self.offset() {
            let is_repeat = self.recovery_offset == Some(chunk.offset);
            let is_new_recovery = self.recovery_offset.is_none();
            self.recovery_offset = Some(chunk.offset);

            return if is_repeat || is_new_recovery {
                vec![self.request_window()]
            }
            else {
                Vec::new()
            };
        }

        self.recovery_offset = None;
        self.received.extend_from_slice(&chunk.data);

        if chunk.remaining_bytes == Some(0) {
            self.complete = true;
            return vec![self.completion()];
        }
        if self.offset() >= self.window_end_offset {
            return vec![self.request_window()];
        }
        Vec::new()
    }
}

impl FakePeer for ReceivingPeer {
    fn on_client_chunk(&mut self, chunk: &Chunk) -> Vec<Chunk> {
        trace!("receiving peer: received {:?}", chunk);

        match chunk.chunk_type {
            ChunkType::Start if self.version.requires_completion_ack() => {
                vec![peer_chunk(self.version, self.session_id, ChunkType::StartAck)]
            }
            ChunkType::Start | ChunkType::StartAckConfirmation => {
                if self.complete {
                    Vec::new()
                }
                else {
                    vec![self.request_window()]
                }
            }
            ChunkType::Data => self.on_data(chunk),
            ChunkType::Completion => {
                self.client_status = chunk.status;
                if self.version.requires_completion_ack() {
                    vec![peer_chunk(self.version, self.session_id, ChunkType::CompletionAck)]
                }
                else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_data;

    #[test]
    fn test_serving_peer_respects_window() {
        let resource = test_data(100);
        let mut peer = ServingPeer::new(ProtocolVersion::LEGACY, 1, resource.clone());

        let start = Chunk {
            offset: 0,
            window_end_offset: Some(50),
            max_chunk_size_bytes: Some(20),
            ..Chunk::new(ProtocolVersion::LEGACY, ChunkType::Start)
        };
        let sent = peer.on_client_chunk(&start);
        assert_eq!(sent.iter().map(|c| (c.offset, c.data.len())).collect::<Vec<_>>(), vec![(0, 20), (20, 20), (40, 10)]);

        let extend = Chunk {
            offset: 50,
            window_end_offset: Some(150),
            ..Chunk::new(ProtocolVersion::LEGACY, ChunkType::ParametersContinue)
        };
        let sent = peer.on_client_chunk(&extend);
        assert_eq!(sent.iter().map(|c| c.offset).collect::<Vec<_>>(), vec![50, 70, 90]);
        assert_eq!(sent.last().and_then(|c| c.remaining_bytes), Some(0));
    }

    #[test]
    fn test_receiving_peer_recovery() {
        let mut peer = ReceivingPeer::new(ProtocolVersion::LEGACY, 1, 100, 10);
        let data = test_data(30);
        let data_chunk = |start: usize, end: usize| Chunk {
            offset: start as u64,
            data: data.slice(start..end),
            remaining_bytes: (end == data.len()).then_some(0),
            ..Chunk::new(ProtocolVersion::LEGACY, ChunkType::Data)
        };

        assert_eq!(peer.on_client_chunk(&Chunk::new(ProtocolVersion::LEGACY, ChunkType::Start)).len(), 1);
        assert!(peer.on_client_chunk(&data_chunk(0, 10)).is_empty());

        // first out-of-order chunk re-requests, stale ones in flight are ignored, a repeat re-requests
        assert_eq!(peer.on_client_chunk(&data_chunk(20, 30))[0].offset, 10);
        assert!(peer.on_client_chunk(&data_chunk(0, 10)).is_empty());
        assert_eq!(peer.on_client_chunk(&data_chunk(0, 10))[0].offset, 10);

        assert!(peer.on_client_chunk(&data_chunk(10, 20)).is_empty());
        let sent = peer.on_client_chunk(&data_chunk(20, 30));
        assert_eq!(sent[0].status, Some(Status::Ok));
        assert!(peer.is_complete());
        assert_eq!(peer.received(), data);
    }
}
