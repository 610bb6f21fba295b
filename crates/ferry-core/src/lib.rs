//! # Ferry Core
//!
//! Transfer engine for sending one file to one or many recipients over
//! end-to-end encrypted sessions.
//!
//! This crate provides:
//! - Per-recipient sessions driving handshake, encryption, pacing and receipts
//! - The receiving side that verifies, sanitizes and stores incoming files
//! - Group orchestration with failure isolation and fair-share bandwidth
//! - Change-driven aggregate progress and late-subscriber-safe callbacks
//! - Signed, timestamped group signaling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    TransferEngine / TransferHandle              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    GroupTransferManager                         │
//! │   (invites, budget, aggregation, one task per recipient)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    RecipientSession  ◄──►  IncomingTransfer     │
//! │   (triple ratchet, manifest, chunks, receipt)                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    PeerLink (ParallelTransport)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use ferry_core::{FerryConfig, FileSource, RecipientDescriptor, TransferEngine};
//! use ferry_core::loopback::{LoopbackConnector, PeerBehavior};
//! use ferry_transport::simulated::LinkProfile;
//! use std::sync::Arc;
//!
//! # async fn demo() -> ferry_core::Result<()> {
//! let config = FerryConfig::default();
//! let connector = Arc::new(LoopbackConnector::new(Arc::new(config.clone()), LinkProfile::lan()));
//! let alice = RecipientDescriptor::new("alice", "Alice", "loopback://alice");
//! connector.add_peer(&alice.id, PeerBehavior::accepting());
//!
//! let engine = TransferEngine::new(config, connector)?;
//! let handle = engine
//!     .create_group_transfer(vec![alice], FileSource::from_bytes("hello.txt", b"hi".to_vec()))
//!     .await?;
//! let outcome = handle.wait().await;
//! println!("{}", outcome.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod bandwidth;
pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod ids;
pub mod link;
pub mod loopback;
pub mod progress;
pub mod receiver;
pub mod recipient;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod signaling;
pub mod source;
pub mod wire;

pub use api::{TransferEngine, TransferHandle};
pub use config::{FerryConfig, TransferConfig};
pub use error::{FerryError, Result};
pub use group::{GroupOutcome, GroupTransferManager, RecipientFailure, TransferMode};
pub use ids::{GroupId, TransferId};
pub use link::{Connector, PeerLink};
pub use progress::{AggregateProgress, GroupStatus, RecipientProgress, RecipientStatus};
pub use receiver::{Destination, IncomingTransfer, ReceiveOptions, ReceivedData, ReceivedFile};
pub use recipient::{RecipientDescriptor, RecipientId};
pub use session::RecipientSession;
pub use source::FileSource;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
