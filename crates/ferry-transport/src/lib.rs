//! # Ferry Transport
//!
//! Parallel channel transport for one peer connection.
//!
//! A logical connection is spread over 2-4 unordered, unreliable,
//! message-oriented channels. This crate provides:
//! - The [`Channel`](channel::Channel) abstraction over the substrate
//! - In-memory simulated channels with latency, jitter, loss and stalls
//! - Per-channel backpressure with high/low watermark hysteresis
//! - Sequence-numbered framing, in-order reassembly, ACK/NACK retransmission
//! - Adaptive chunk sizing from observed RTT and loss
//!
//! ## Architecture
//!
//! ```text
//!            send_chunk(payload)
//!                   │
//!        ┌──────────▼──────────┐      ┌──────────────────┐
//!        │  ParallelTransport  │◄─────│ RetransmitBuffer │ (unacked frames)
//!        └──┬──────┬──────┬────┘      └──────────────────┘
//!   gate ─► │      │      │  ◄─ round-robin over open channels
//!        ┌──▼─┐ ┌──▼─┐ ┌──▼─┐
//!        │ ch0│ │ ch1│ │ ch2│   unordered, lossy
//!        └──┬─┘ └──┬─┘ └──┬─┘
//!           └──────┼──────┘
//!           ┌──────▼──────┐
//!           │ Reassembler │ ── in-order payloads ─► on_receive(handler)
//!           └─────────────┘ ── ACK / NACK back to the sender
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backpressure;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod parallel;
pub mod reassembly;
pub mod retransmit;
pub mod simulated;
pub mod sizing;

pub use backpressure::{BackpressureGate, FlowState, Watermarks};
pub use channel::{Channel, ChannelId, ChannelStats};
pub use config::{ChunkSizingConfig, TransportConfig};
pub use error::{FrameError, TransportError, TransportResult};
pub use parallel::{ParallelTransport, ReceiveHandler, TransportStats};
pub use sizing::AdaptiveChunkSizer;

/// Smallest channel fan-out for one peer connection
pub const MIN_CHANNELS: usize = 2;

/// Largest channel fan-out for one peer connection
pub const MAX_CHANNELS: usize = 4;
