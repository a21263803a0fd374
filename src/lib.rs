//! This is the client side of a reliable, resumable, windowed transfer protocol. It moves a blob
//!  of bytes (a 'resource', identified by a numeric id) between a client and a remote peer over
//!  a message oriented channel that may drop, duplicate or reorder messages ('chunks').
//!
//! ## Scope
//!
//! This crate is the transfer state machine only:
//! * Chunks are pre-parsed structured values. Encoding them for the wire is the transport's job.
//! * Outbound chunks are handed to a [chunk_sender::ChunkSender], fire-and-forget.
//! * Routing inbound chunks to the right [transfer::Transfer] (by session id) is the job of an
//!    external dispatcher. The dispatcher learns about completed transfers through a
//!    [chunk_sender::TransferEndListener].
//!
//! ## Protocol outline
//!
//! A transfer goes through the states
//!
//! ```ascii
//! INITIATING -> WAITING <-> TRANSMITTING / RECOVERY -> TERMINATING -> COMPLETE
//! ```
//!
//! * The client sends START. Starting with protocol version 2, the peer answers with START_ACK,
//!    assigning a session id and declaring its own protocol version. The client confirms with
//!    START_ACK_CONFIRMATION, and the effective version is the lower of both peers' versions.
//!   * A peer that answers START with anything else is assumed to speak the legacy protocol,
//!      which has no handshake: the session id is the resource id.
//!   * A client configured for the legacy protocol skips INITIATING altogether.
//! * The receiving side controls the flow of data: it grants a *window* (an offset and the
//!    offset where the sender must stop) and a max chunk size.
//!   * PARAMETERS_RETRANSMIT asks the sender to (re)start at the given offset. This is how lost
//!      data is recovered: the receiver never buffers out-of-order data but asks for everything
//!      from the first missing byte.
//!   * PARAMETERS_CONTINUE extends the window without rewinding, so that the sender need not
//!      stall while the receiver processes data.
//! * The final data chunk has `remaining_bytes == 0`. The side that received all data sends
//!    COMPLETION with a status, and starting with version 2 waits for COMPLETION_ACK.
//! * Every inbound chunk re-arms a response timer. When it expires, the client re-sends what the
//!    peer apparently did not receive, up to a configurable number of retries in a row and over
//!    the transfer's lifetime. After that, the transfer fails with DEADLINE_EXCEEDED.
//!
//! Protocol outcomes (including failures) are [status::Status] values, available once the
//!  transfer is done. Nothing is reported as a Rust error after a transfer was created
//!  successfully.

pub mod chunk;
pub mod chunk_sender;
pub mod config;
pub mod progress;
pub mod status;
pub mod timer;
pub mod transfer;

#[cfg(test)]
mod test_util;
