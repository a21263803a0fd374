//! Fixtures for testing transfers: a transfer wired to channels instead of a transport, chunk
//!  builders, scripted server peers for both directions and a link that loses, duplicates and
//!  reorders chunks.

pub mod peers;

use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::mpsc;
use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::config::{ReadTransferConfig, TransferConfig};
use crate::progress::ProgressCallback;
use crate::status::Status;
use crate::transfer::Transfer;

/// short timeouts, a few retries
pub fn test_config(protocol_version: ProtocolVersion) -> Arc<TransferConfig> {
    Arc::new(TransferConfig {
        response_timeout: Duration::from_secs(1),
        initial_response_timeout: Duration::from_secs(2),
        max_retries: 3,
        max_lifetime_retries: 100,
        protocol_version,
    })
}

pub fn test_data(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i * 7 % 251) as u8)
        .collect::<Vec<_>>()
        .into()
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Chunk>) -> Vec<Chunk> {
    let mut result = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        result.push(chunk);
    }
    result
}

/// gives spawned window transmissions a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn parameters_chunk(version: ProtocolVersion, chunk_type: ChunkType, session_id: u32, offset: u64, window_end_offset: u64, max_chunk_size: u32) -> Chunk {
    Chunk {
        session_id: Some(session_id),
        offset,
        window_end_offset: Some(window_end_offset),
        max_chunk_size_bytes: Some(max_chunk_size),
        ..Chunk::new(version, chunk_type)
    }
}

pub fn data_chunk(version: ProtocolVersion, session_id: u32, data: &Bytes, start: usize, end: usize, is_final: bool) -> Chunk {
    Chunk {
        session_id: Some(session_id),
        offset: start as u64,
        data: data.slice(start..end),
        remaining_bytes: is_final.then_some(0),
        ..Chunk::new(version, ChunkType::Data)
    }
}

/// A transfer whose outbound chunks and end notification are captured in channels
pub struct TestTransfer {
    pub transfer: Transfer,
    pub chunks: mpsc::UnboundedReceiver<Chunk>,
    pub ends: mpsc::UnboundedReceiver<(u32, Status)>,
}

impl TestTransfer {
    pub fn read(resource_id: u32, config: Arc<TransferConfig>, read_config: ReadTransferConfig) -> TestTransfer {
        Self::create(|chunk_sender, end_listener| Transfer::new_read(resource_id, config, read_config, chunk_sender, end_listener, None))
    }

    pub fn read_with_progress(resource_id: u32, config: Arc<TransferConfig>, read_config: ReadTransferConfig, progress_callback: ProgressCallback) -> TestTransfer {
        Self::create(|chunk_sender, end_listener| Transfer::new_read(resource_id, config, read_config, chunk_sender, end_listener, Some(progress_callback)))
    }

    pub fn write(resource_id: u32, data: Bytes, config: Arc<TransferConfig>) -> TestTransfer {
        Self::create(|chunk_sender, end_listener| Transfer::new_write(resource_id, data, config, chunk_sender, end_listener, None))
    }

    pub fn write_with_progress(resource_id: u32, data: Bytes, config: Arc<TransferConfig>, progress_callback: ProgressCallback) -> TestTransfer {
        Self::create(|chunk_sender, end_listener| Transfer::new_write(resource_id, data, config, chunk_sender, end_listener, Some(progress_callback)))
    }

    fn create<F>(f: F) -> TestTransfer
    where F: FnOnce(Arc<mpsc::UnboundedSender<Chunk>>, Arc<mpsc::UnboundedSender<(u32, Status)>>) -> anyhow::Result<Transfer>
    {
        let (chunk_sender, chunks) = mpsc::unbounded_channel();
        let (end_listener, ends) = mpsc::unbounded_channel();

        let transfer = f(Arc::new(chunk_sender), Arc::new(end_listener))
            .expect("test configuration should be valid");

        TestTransfer {
            transfer,
            chunks,
            ends,
        }
    }
}
