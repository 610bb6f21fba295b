//! Public entry points.
//!
//! [`TransferEngine`] validates input, computes the file digest and starts
//! a [`GroupTransferManager`] in the background. The returned
//! [`TransferHandle`] exposes progress, completion and failure callbacks,
//! cancellation and an awaitable outcome.

use crate::config::FerryConfig;
use crate::error::Result;
use crate::events::EventHub;
use crate::group::{
    GroupContext, GroupOutcome, GroupTransferManager, RecipientFailure, TransferMode,
};
use crate::ids::GroupId;
use crate::link::Connector;
use crate::progress::{AggregateProgress, GroupStatus};
use crate::recipient::{RecipientDescriptor, RecipientId, validate_recipients};
use crate::registry::SessionRegistry;
use crate::session::RecipientSession;
use crate::source::FileSource;
use ferry_crypto::identity::IdentityKeypair;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

const DEFAULT_SENDER_NAME: &str = "ferry";

/// Transfer engine: owns configuration, connector, identity and registry
pub struct TransferEngine {
    config: Arc<FerryConfig>,
    connector: Arc<dyn Connector>,
    identity: Option<Arc<IdentityKeypair>>,
    registry: Arc<SessionRegistry>,
    sender_name: String,
}

impl TransferEngine {
    /// Engine using `connector` to reach recipients.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`](crate::FerryError::Validation)
    /// for an invalid configuration.
    pub fn new(config: FerryConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(SessionRegistry::new(config.transfer.registry_capacity));
        Ok(Self {
            config: Arc::new(config),
            connector,
            identity: None,
            registry,
            sender_name: DEFAULT_SENDER_NAME.to_string(),
        })
    }

    /// Sign handshakes and invites with `identity`.
    #[must_use]
    pub fn with_identity(mut self, identity: Arc<IdentityKeypair>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Name shown to recipients in invites.
    #[must_use]
    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &Arc<FerryConfig> {
        &self.config
    }

    /// Live session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send `source` to one recipient, connecting directly.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`](crate::FerryError::Validation)
    /// for a malformed recipient or empty file, and
    /// [`FerryError::Io`](crate::FerryError::Io) for an unreadable file.
    /// Nothing has been sent when this fails.
    pub async fn create_single_transfer(
        &self,
        recipient: RecipientDescriptor,
        source: FileSource,
    ) -> Result<TransferHandle> {
        self.start(TransferMode::Single, vec![recipient], source)
            .await
    }

    /// Send `source` to every recipient in parallel, inviting each first.
    ///
    /// # Errors
    ///
    /// As [`Self::create_single_transfer`], plus an empty or duplicated
    /// recipient list.
    pub async fn create_group_transfer(
        &self,
        recipients: Vec<RecipientDescriptor>,
        source: FileSource,
    ) -> Result<TransferHandle> {
        self.start(TransferMode::Group, recipients, source).await
    }

    async fn start(
        &self,
        mode: TransferMode,
        recipients: Vec<RecipientDescriptor>,
        source: FileSource,
    ) -> Result<TransferHandle> {
        validate_recipients(&recipients)?;
        source.validate()?;
        source.digest().await?;

        let events = Arc::new(EventHub::new());
        let ctx = GroupContext {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            identity: self.identity.clone(),
            registry: Arc::clone(&self.registry),
            sender_name: self.sender_name.clone(),
        };
        let manager = Arc::new(GroupTransferManager::initialize(
            ctx,
            mode,
            recipients,
            Arc::clone(&events),
        )?);
        debug!(group = %manager.group_id(), ?mode, "transfer created");

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let runner = Arc::clone(&manager);
        tokio::spawn(async move {
            let outcome = match runner.send_to_all(source).await {
                Ok(outcome) => outcome,
                Err(e) => runner.fail_all(&e),
            };
            outcome_tx.send_replace(Some(outcome));
        });

        Ok(TransferHandle {
            manager,
            events,
            outcome: outcome_rx,
        })
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field(
                "identity",
                &self.identity.as_ref().map(|i| i.public_key().fingerprint()),
            )
            .field("registry", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Handle to a running transfer
#[derive(Debug, Clone)]
pub struct TransferHandle {
    manager: Arc<GroupTransferManager>,
    events: Arc<EventHub>,
    outcome: watch::Receiver<Option<GroupOutcome>>,
}

impl TransferHandle {
    /// Group id.
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.manager.group_id()
    }

    /// Current group status.
    #[must_use]
    pub fn status(&self) -> GroupStatus {
        self.manager.status()
    }

    /// Mean progress across recipients.
    #[must_use]
    pub fn progress(&self) -> AggregateProgress {
        self.manager.aggregate_progress()
    }

    /// Session for one recipient, once it has connected.
    #[must_use]
    pub fn session(&self, recipient: &RecipientId) -> Option<Arc<RecipientSession>> {
        self.manager.session(recipient)
    }

    /// Called on every reported change of aggregate progress.
    pub fn on_progress(&self, callback: impl Fn(AggregateProgress) + Send + Sync + 'static) {
        self.events.on_progress(Arc::new(callback));
    }

    /// Called once with the final outcome.
    pub fn on_complete(&self, callback: impl Fn(&GroupOutcome) + Send + Sync + 'static) {
        self.events.on_complete(Arc::new(callback));
    }

    /// Called for every recipient that fails.
    pub fn on_recipient_failed(
        &self,
        callback: impl Fn(&RecipientFailure) + Send + Sync + 'static,
    ) {
        self.events.on_recipient_failed(Arc::new(callback));
    }

    /// Cancel all recipients.
    pub fn cancel(&self) {
        self.manager.cancel_all();
    }

    /// Outcome if the transfer has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<GroupOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for every recipient to finish.
    pub async fn wait(&self) -> GroupOutcome {
        let mut rx = self.outcome.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Runner task is gone; the hub still has what it published.
                if let Some(outcome) = self.events.outcome() {
                    return outcome;
                }
                return self.manager.fail_all(&crate::FerryError::Protocol(
                    "transfer task ended without an outcome".into(),
                ));
            }
        }
    }
}
