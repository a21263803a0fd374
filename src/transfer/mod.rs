//! The transfer state machine shared by both directions.
//!
//! A [Transfer] is a cheap handle around `Arc<RwLock<TransferInner>>`. Every entry point (the
//!  dispatcher calling `handle_chunk`, a timer expiring, the next step of a write window) takes
//!  the write lock and runs one protocol step synchronously, so steps never interleave. Deferred
//!  work (timer, window transmission) runs on spawned tasks that hold only a `Weak` reference,
//!  so dropping the handle ends a transfer's background activity.

mod read_transfer;
mod write_transfer;

use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, trace, warn};
use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::chunk_sender::{ChunkSender, TransferEndListener};
use crate::config::{ReadTransferConfig, TransferConfig};
use crate::progress::{ProgressCallback, ProgressStats};
use crate::status::Status;
use crate::timer::{Timer, TimerCallback};
use read_transfer::ReadTransfer;
use write_transfer::WriteTransfer;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransferState {
    /// START was sent, waiting for the peer's START_ACK (version 2 and later only)
    Initiating,
    Waiting,
    /// a write window is being sent
    Transmitting,
    /// a read received out-of-order data and waits for the peer to resume at the expected offset
    Recovery,
    /// a terminating chunk was sent, waiting for the peer's COMPLETION_ACK
    Terminating,
    Complete,
}

impl Display for TransferState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The result of handing a chunk to a direction's data handler
#[must_use]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DataChunkOutcome {
    Pending,
    /// the transfer is over, from this side's perspective: send a terminating chunk with this status
    Terminate(Status),
}

/// The behavior that differs between reading and writing
pub(crate) trait TransferDirection {
    /// adds direction specific parameters to START and START_ACK_CONFIRMATION
    fn set_initial_chunk_fields(&mut self, chunk: &mut Chunk);

    fn handle_data_chunk(&mut self, core: &mut TransferCore, chunk: &Chunk) -> DataChunkOutcome;

    fn retry_after_data_timeout(&mut self, core: &mut TransferCore);

    fn data(&self) -> Bytes;

    /// the number of bytes transferred once the transfer completed successfully
    fn completed_len(&self) -> u64;
}

pub(crate) enum Direction {
    Read(ReadTransfer),
    Write(WriteTransfer),
}

impl Direction {
    fn handler(&mut self) -> &mut dyn TransferDirection {
        match self {
            Direction::Read(read) => read,
            Direction::Write(write) => write,
        }
    }

    fn data(&self) -> Bytes {
        match self {
            Direction::Read(read) => read.data(),
            Direction::Write(write) => write.data(),
        }
    }

    fn completed_len(&self) -> u64 {
        match self {
            Direction::Read(read) => read.completed_len(),
            Direction::Write(write) => write.completed_len(),
        }
    }
}

/// State and collaborators shared by both directions
pub(crate) struct TransferCore {
    resource_id: u32,
    session_id: Option<u32>,
    state: TransferState,
    status: Status,
    desired_protocol_version: ProtocolVersion,
    configured_protocol_version: ProtocolVersion,
    last_chunk: Option<Chunk>,
    retries: u32,
    lifetime_retries: u32,
    config: Arc<TransferConfig>,
    peer_contacted: bool,
    timer: Timer,
    chunk_sender: Arc<dyn ChunkSender>,
    end_listener: Arc<dyn TransferEndListener>,
    progress_callback: Option<ProgressCallback>,
    done: watch::Sender<bool>,
    self_ref: Weak<RwLock<TransferInner>>,
}

impl TransferCore {
    /// the session id once it is known, the resource id before that
    fn id(&self) -> u32 {
        self.session_id.unwrap_or(self.resource_id)
    }

    fn outbound_protocol_version(&self) -> ProtocolVersion {
        if self.configured_protocol_version == ProtocolVersion::UNKNOWN {
            self.desired_protocol_version
        }
        else {
            self.configured_protocol_version
        }
    }

    pub(crate) fn state(&self) -> TransferState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            debug!("transfer {}: {} -> {}", self.id(), self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn self_ref(&self) -> Weak<RwLock<TransferInner>> {
        self.self_ref.clone()
    }

    /// a chunk addressed to this transfer's peer, with no other fields set
    pub(crate) fn new_chunk(&self, chunk_type: ChunkType) -> Chunk {
        Chunk {
            session_id: Some(self.id()),
            ..Chunk::new(self.outbound_protocol_version(), chunk_type)
        }
    }

    pub(crate) fn send_chunk(&mut self, chunk: Chunk) {
        trace!("transfer {}: sending {:?}", self.id(), chunk);
        self.last_chunk = Some(chunk.clone());
        self.chunk_sender.send_chunk(chunk);
    }

    pub(crate) fn resend_last_chunk(&mut self) {
        if let Some(chunk) = self.last_chunk.clone() {
            trace!("transfer {}: re-sending {:?}", self.id(), chunk);
            self.chunk_sender.send_chunk(chunk);
        }
    }

    pub(crate) fn update_progress(&self, bytes_sent: u64, bytes_confirmed_received: u64, total_size_bytes: Option<u64>) {
        if let Some(callback) = &self.progress_callback {
            callback(ProgressStats::new(bytes_sent, bytes_confirmed_received, total_size_bytes));
        }
    }

    fn finish(&mut self, status: Status, skip_callback: bool, completed_len: u64) {
        if self.state == TransferState::Complete {
            return;
        }

        self.timer.stop();
        self.status = status;

        if status.is_ok() {
            self.update_progress(completed_len, completed_len, Some(completed_len));
            info!("transfer {} (resource {}) completed successfully", self.id(), self.resource_id);
        }
        else {
            info!("transfer {} (resource {}) completed with status {}", self.id(), self.resource_id, status);
        }

        if !skip_callback {
            self.end_listener.end_transfer(self.id(), status);
        }

        self.set_state(TransferState::Complete);
        self.done.send_replace(true);
    }
}

pub(crate) struct TransferInner {
    core: TransferCore,
    direction: Direction,
}

impl TransferInner {
    fn begin(&mut self) {
        if self.core.last_chunk.is_some() || self.core.state == TransferState::Complete {
            warn!("transfer {} was already started - ignoring", self.core.id());
            return;
        }

        let version = self.core.desired_protocol_version;
        if !version.is_supported() {
            error!("cannot start transfer for resource {}: unsupported protocol version {}", self.core.resource_id, version);
            self.finish(Status::InvalidArgument, false);
            return;
        }

        debug!("starting transfer for resource {} with protocol version {}", self.core.resource_id, version);

        let mut chunk = self.core.new_chunk(ChunkType::Start);
        chunk.resource_id = Some(self.core.resource_id);
        self.direction.handler().set_initial_chunk_fields(&mut chunk);
        self.core.send_chunk(chunk);

        let initial_response_timeout = self.core.config.initial_response_timeout;
        self.core.timer.start(Some(initial_response_timeout));
    }

    fn handle_chunk(&mut self, chunk: Chunk) {
        if self.core.state == TransferState::Complete {
            debug!("transfer {} is complete - ignoring {:?}", self.core.id(), chunk);
            return;
        }
        trace!("transfer {}: received {:?}", self.core.id(), chunk);

        self.core.timer.stop();
        self.core.retries = 0;
        self.core.peer_contacted = true;

        if let Some(status) = chunk.status {
            if self.core.configured_protocol_version.requires_completion_ack() {
                let ack = self.core.new_chunk(ChunkType::CompletionAck);
                self.core.send_chunk(ack);
            }
            self.finish(status, false);
            return;
        }

        match self.core.state {
            TransferState::Initiating => self.perform_initial_handshake(&chunk),
            TransferState::Terminating => {
                if chunk.chunk_type == ChunkType::CompletionAck {
                    let status = self.core.status;
                    self.finish(status, false);
                }
                else {
                    debug!("transfer {}: expected completion ack, got {:?}", self.core.id(), chunk);
                    self.on_timeout();
                }
            }
            _ => self.handle_data_chunk(&chunk),
        }

        if self.core.state != TransferState::Complete {
            self.core.timer.start(None);
        }
    }

    fn perform_initial_handshake(&mut self, chunk: &Chunk) {
        if chunk.chunk_type != ChunkType::StartAck {
            let session_id = chunk.assigned_session_id()
                .unwrap_or(self.core.resource_id);
            info!("resource {}: peer did not acknowledge the handshake, falling back to the legacy protocol with session {}", self.core.resource_id, session_id);

            self.core.configured_protocol_version = ProtocolVersion::LEGACY;
            self.core.session_id = Some(session_id);
            self.core.set_state(TransferState::Waiting);
            self.handle_data_chunk(chunk);
            return;
        }

        self.core.session_id = Some(chunk.assigned_session_id().unwrap_or(self.core.resource_id));

        let negotiated = self.core.desired_protocol_version.min(chunk.protocol_version);
        self.core.configured_protocol_version = negotiated;
        if !negotiated.is_supported() {
            error!("transfer {}: peer acknowledged the handshake with unsupported protocol version {}", self.core.id(), chunk.protocol_version);
            self.send_final_chunk(Status::InvalidArgument);
            return;
        }

        debug!("resource {}: handshake acknowledged, session {} with protocol version {}", self.core.resource_id, self.core.id(), negotiated);

        let mut confirmation = self.core.new_chunk(ChunkType::StartAckConfirmation);
        self.direction.handler().set_initial_chunk_fields(&mut confirmation);
        self.core.send_chunk(confirmation);
        self.core.set_state(TransferState::Waiting);
    }

    fn handle_data_chunk(&mut self, chunk: &Chunk) {
        match self.direction.handler().handle_data_chunk(&mut self.core, chunk) {
            DataChunkOutcome::Pending => {}
            DataChunkOutcome::Terminate(status) => self.send_final_chunk(status),
        }
    }

    fn on_timeout(&mut self) {
        if self.core.state == TransferState::Complete {
            return;
        }

        self.core.retries += 1;
        self.core.lifetime_retries += 1;

        let config = self.core.config.clone();
        if self.core.retries > config.max_retries || self.core.lifetime_retries > config.max_lifetime_retries {
            if self.core.state == TransferState::Terminating {
                debug!("transfer {}: no completion ack from the peer, finishing anyway", self.core.id());
                let status = self.core.status;
                self.finish(status, false);
            }
            else {
                error!("transfer {} (resource {}): giving up after {} retries ({} over its lifetime)",
                    self.core.id(), self.core.resource_id, self.core.retries - 1, self.core.lifetime_retries - 1);
                self.finish(Status::DeadlineExceeded, false);
            }
            return;
        }

        debug!("transfer {}: timed out in state {}, retry {} of {}", self.core.id(), self.core.state, self.core.retries, config.max_retries);

        let resend_last_chunk = matches!(self.core.state, TransferState::Initiating | TransferState::Terminating)
            || self.core.last_chunk.as_ref().is_some_and(|c| c.is_handshake_chunk());

        if resend_last_chunk {
            self.core.resend_last_chunk();
        }
        else {
            self.direction.handler().retry_after_data_timeout(&mut self.core);
        }

        self.core.timer.start(None);
    }

    fn send_final_chunk(&mut self, status: Status) {
        let mut chunk = self.core.new_chunk(ChunkType::Completion);
        chunk.status = Some(status);
        self.core.send_chunk(chunk);

        if self.core.configured_protocol_version.requires_completion_ack() {
            self.core.status = status;
            self.core.set_state(TransferState::Terminating);
            self.core.timer.start(None);
        }
        else {
            self.finish(status, false);
        }
    }

    fn finish(&mut self, status: Status, skip_callback: bool) {
        let completed_len = self.direction.completed_len();
        self.core.finish(status, skip_callback, completed_len);
    }

    fn terminate(&mut self, status: Status) {
        if matches!(self.core.state, TransferState::Terminating | TransferState::Complete) {
            debug!("transfer {} is already ending - ignoring termination with {}", self.core.id(), status);
            return;
        }

        if !self.core.peer_contacted {
            debug!("transfer {} terminated with {} before the peer responded", self.core.id(), status);
            self.finish(status, false);
            return;
        }

        debug!("transfer {} terminated locally with {}", self.core.id(), status);
        self.core.timer.stop();
        self.send_final_chunk(status);
    }
}

struct TransferTimeout {
    transfer: Weak<RwLock<TransferInner>>,
}

#[async_trait]
impl TimerCallback for TransferTimeout {
    async fn on_timer_expired(&self, generation: u64) {
        let Some(transfer) = self.transfer.upgrade() else {
            return;
        };

        let mut inner = transfer.write().await;
        if inner.core.timer.take_expired(generation) {
            inner.on_timeout();
        }
    }
}

/// A single client-side transfer of one resource, in either direction.
///
/// The dispatcher that creates a transfer calls [Transfer::begin] once and then passes every
///  chunk addressed to this transfer to [Transfer::handle_chunk]. The outcome is available
///  through [Transfer::status] once [Transfer::wait_until_done] returns.
pub struct Transfer {
    inner: Arc<RwLock<TransferInner>>,
    resource_id: u32,
    done: watch::Receiver<bool>,
}

impl Transfer {
    /// Creates a transfer that downloads the resource from the peer.
    pub fn new_read(
        resource_id: u32,
        config: Arc<TransferConfig>,
        read_config: ReadTransferConfig,
        chunk_sender: Arc<dyn ChunkSender>,
        end_listener: Arc<dyn TransferEndListener>,
        progress_callback: Option<ProgressCallback>,
    ) -> anyhow::Result<Transfer> {
        read_config.validate()?;
        Self::new(resource_id, config, Direction::Read(ReadTransfer::new(read_config)), chunk_sender, end_listener, progress_callback)
    }

    /// Creates a transfer that uploads `data` to the peer.
    pub fn new_write(
        resource_id: u32,
        data: Bytes,
        config: Arc<TransferConfig>,
        chunk_sender: Arc<dyn ChunkSender>,
        end_listener: Arc<dyn TransferEndListener>,
        progress_callback: Option<ProgressCallback>,
    ) -> anyhow::Result<Transfer> {
        Self::new(resource_id, config, Direction::Write(WriteTransfer::new(data)), chunk_sender, end_listener, progress_callback)
    }

    fn new(
        resource_id: u32,
        config: Arc<TransferConfig>,
        direction: Direction,
        chunk_sender: Arc<dyn ChunkSender>,
        end_listener: Arc<dyn TransferEndListener>,
        progress_callback: Option<ProgressCallback>,
    ) -> anyhow::Result<Transfer> {
        config.validate()?;

        let desired_protocol_version = config.protocol_version;
        let (state, session_id, configured_protocol_version) = if desired_protocol_version == ProtocolVersion::LEGACY {
            (TransferState::Waiting, Some(resource_id), ProtocolVersion::LEGACY)
        }
        else {
            (TransferState::Initiating, None, ProtocolVersion::UNKNOWN)
        };

        let (done_sender, done) = watch::channel(false);

        let inner = Arc::new_cyclic(|self_ref: &Weak<RwLock<TransferInner>>| {
            let timer = Timer::new(config.response_timeout, Arc::new(TransferTimeout { transfer: self_ref.clone() }));

            RwLock::new(TransferInner {
                core: TransferCore {
                    resource_id,
                    session_id,
                    state,
                    status: Status::Unknown,
                    desired_protocol_version,
                    configured_protocol_version,
                    last_chunk: None,
                    retries: 0,
                    lifetime_retries: 0,
                    config,
                    peer_contacted: false,
                    timer,
                    chunk_sender,
                    end_listener,
                    progress_callback,
                    done: done_sender,
                    self_ref: self_ref.clone(),
                },
                direction,
            })
        });

        Ok(Transfer {
            inner,
            resource_id,
            done,
        })
    }

    /// Sends the initial chunk. A transfer with an unsupported protocol version completes
    ///  immediately with INVALID_ARGUMENT instead, without any traffic.
    pub async fn begin(&self) {
        self.inner.write().await
            .begin();
    }

    pub async fn handle_chunk(&self, chunk: Chunk) {
        self.inner.write().await
            .handle_chunk(chunk);
    }

    /// Cancels the transfer locally. If the peer was contacted, it is notified with a terminating
    ///  chunk carrying `status`.
    pub async fn terminate(&self, status: Status) {
        self.inner.write().await
            .terminate(status);
    }

    /// Completes the transfer without any traffic and without notifying the end listener
    pub async fn abandon(&self, status: Status) {
        self.inner.write().await
            .finish(status, true);
    }

    pub async fn id(&self) -> u32 {
        self.inner.read().await
            .core.id()
    }

    pub fn resource_id(&self) -> u32 {
        self.resource_id
    }

    /// UNKNOWN while the transfer is in progress
    pub async fn status(&self) -> Status {
        self.inner.read().await
            .core.status
    }

    /// for a read, the data received so far; for a write, the data being sent
    pub async fn data(&self) -> Bytes {
        self.inner.read().await
            .direction.data()
    }

    pub async fn state(&self) -> TransferState {
        self.inner.read().await
            .core.state
    }

    /// the negotiated protocol version, UNKNOWN until the handshake completed
    pub async fn protocol_version(&self) -> ProtocolVersion {
        self.inner.read().await
            .core.configured_protocol_version
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub async fn wait_until_done(&self) {
        let mut done = self.done.clone();
        // the sender lives as long as the transfer, so this can not fail while `self` exists
        let _ = done.wait_for(|&is_done| is_done).await;
    }

    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }
}
