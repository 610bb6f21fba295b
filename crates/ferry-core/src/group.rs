//! Multi-recipient orchestration.
//!
//! [`GroupTransferManager`] runs one [`RecipientSession`] per recipient in
//! its own task. Failures are isolated: a recipient that fails is reported
//! and released from the bandwidth budget while the others continue. The
//! group outcome is `Completed`, `Partial` or `Failed` depending on how
//! many recipients verified the file.

use crate::bandwidth::{BandwidthBudget, Pacer};
use crate::config::{FerryConfig, SIGNALING_FUTURE_SKEW};
use crate::error::{FerryError, Result};
use crate::events::EventHub;
use crate::ids::GroupId;
use crate::link::Connector;
use crate::lock;
use crate::progress::{
    AggregateProgress, GroupStatus, ProgressAggregator, RecipientProgress, RecipientStatus,
};
use crate::recipient::{RecipientDescriptor, RecipientId, validate_recipients};
use crate::registry::SessionRegistry;
use crate::session::RecipientSession;
use crate::signaling::{GroupInvite, SignalBody, SignalEnvelope};
use crate::source::FileSource;
use ferry_crypto::identity::IdentityKeypair;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

/// Whether recipients are invited over signaling first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One recipient, connected directly
    Single,
    /// Invite, then connect, each recipient
    Group,
}

/// A recipient that did not receive the file
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientFailure {
    /// Recipient
    pub recipient: RecipientId,
    /// What went wrong
    pub error: FerryError,
}

/// Result of a finished group transfer
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    /// Group
    pub group_id: GroupId,
    /// `Completed`, `Partial` or `Failed`
    pub status: GroupStatus,
    /// Recipients that verified the file
    pub succeeded: Vec<RecipientId>,
    /// Recipients that did not
    pub failed: Vec<RecipientFailure>,
    /// Wall time from start to the last recipient finishing
    pub elapsed: Duration,
}

/// Shared collaborators handed to every manager
#[derive(Clone)]
pub struct GroupContext {
    /// Engine configuration
    pub config: Arc<FerryConfig>,
    /// Signaling and transport setup
    pub connector: Arc<dyn Connector>,
    /// Sender identity
    pub identity: Option<Arc<IdentityKeypair>>,
    /// Session registry
    pub registry: Arc<SessionRegistry>,
    /// Sender name shown in invites
    pub sender_name: String,
}

/// Orchestrates one file to many recipients
pub struct GroupTransferManager {
    group_id: GroupId,
    mode: TransferMode,
    ctx: GroupContext,
    recipients: Vec<RecipientDescriptor>,
    recipient_count: u32,
    sessions: Mutex<Vec<Option<Arc<RecipientSession>>>>,
    budget: BandwidthBudget,
    aggregator: Mutex<ProgressAggregator>,
    status: watch::Sender<GroupStatus>,
    cancelled: watch::Sender<bool>,
    events: Arc<EventHub>,
}

impl GroupTransferManager {
    /// Validate `recipients` and prepare a manager.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`] for an empty, duplicated or
    /// malformed recipient list, for more recipients than the session
    /// registry holds, or if a single transfer is given more than one
    /// recipient.
    pub fn initialize(
        ctx: GroupContext,
        mode: TransferMode,
        recipients: Vec<RecipientDescriptor>,
        events: Arc<EventHub>,
    ) -> Result<Self> {
        validate_recipients(&recipients)?;
        if mode == TransferMode::Single && recipients.len() != 1 {
            return Err(FerryError::validation(
                "single transfer takes exactly one recipient",
            ));
        }
        let n = recipients.len();
        let recipient_count = recipient_count(n)?;
        if n > ctx.registry.capacity() {
            return Err(FerryError::validation(format!(
                "{n} recipients exceed the session registry capacity of {}",
                ctx.registry.capacity()
            )));
        }
        let (status, _) = watch::channel(GroupStatus::Preparing);
        let (cancelled, _) = watch::channel(false);
        Ok(Self {
            group_id: GroupId::generate()?,
            mode,
            budget: BandwidthBudget::new(ctx.config.transfer.bandwidth_limit_bps),
            aggregator: Mutex::new(ProgressAggregator::new(
                n,
                ctx.config.transfer.progress_min_interval(),
            )),
            ctx,
            recipients,
            recipient_count,
            sessions: Mutex::new(vec![None; n]),
            status,
            cancelled,
            events,
        })
    }

    /// Group id.
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Recipients in order.
    #[must_use]
    pub fn recipients(&self) -> &[RecipientDescriptor] {
        &self.recipients
    }

    /// Current group status.
    #[must_use]
    pub fn status(&self) -> GroupStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<GroupStatus> {
        self.status.subscribe()
    }

    /// Mean progress across all recipients.
    #[must_use]
    pub fn aggregate_progress(&self) -> AggregateProgress {
        lock(&self.aggregator).snapshot()
    }

    /// Session for `recipient`, once connected.
    #[must_use]
    pub fn session(&self, recipient: &RecipientId) -> Option<Arc<RecipientSession>> {
        let index = self.recipients.iter().position(|r| r.id == *recipient)?;
        lock(&self.sessions).get(index).cloned().flatten()
    }

    /// Send `source` to every recipient concurrently and wait for all of
    /// them to finish.
    ///
    /// # Errors
    ///
    /// Only failures that prevent any session from starting (empty or
    /// unreadable file) are returned; per-recipient failures are part of
    /// the outcome.
    pub async fn send_to_all(self: &Arc<Self>, source: FileSource) -> Result<GroupOutcome> {
        let started = Instant::now();
        source.validate()?;
        source.digest().await?;

        self.set_status(GroupStatus::Negotiating);
        info!(
            group = %self.group_id,
            recipients = self.recipients.len(),
            file = %source.name(),
            bytes = source.len(),
            "starting group transfer"
        );

        let tasks: Vec<_> = (0..self.recipients.len())
            .map(|index| {
                let manager = Arc::clone(self);
                let source = source.clone();
                let span = info_span!("recipient", id = %self.recipients[index].id);
                tokio::spawn(
                    async move { manager.drive_recipient(index, source).await }.instrument(span),
                )
            })
            .collect();

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let recipient = self.recipients[index].id.clone();
            match task.await {
                Ok(Ok(())) => succeeded.push(recipient),
                Ok(Err(error)) => failed.push(RecipientFailure { recipient, error }),
                Err(e) => {
                    let error = FerryError::Protocol(format!("recipient task aborted: {e}"));
                    self.events.emit_failure(RecipientFailure {
                        recipient: recipient.clone(),
                        error: error.clone(),
                    });
                    failed.push(RecipientFailure { recipient, error });
                }
            }
        }

        let status = GroupStatus::from_counts(succeeded.len(), self.recipients.len());
        self.set_status(status);
        let outcome = GroupOutcome {
            group_id: self.group_id,
            status,
            succeeded,
            failed,
            elapsed: started.elapsed(),
        };
        info!(
            group = %self.group_id,
            status = %status,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "group transfer finished"
        );
        self.events.emit_complete(&outcome);
        Ok(outcome)
    }

    /// Finish the group without running any session, failing every
    /// recipient with `error`.
    pub(crate) fn fail_all(&self, error: &FerryError) -> GroupOutcome {
        let failed: Vec<_> = self
            .recipients
            .iter()
            .map(|r| RecipientFailure {
                recipient: r.id.clone(),
                error: error.clone(),
            })
            .collect();
        for failure in &failed {
            self.events.emit_failure(failure.clone());
        }
        self.set_status(GroupStatus::Failed);
        let outcome = GroupOutcome {
            group_id: self.group_id,
            status: GroupStatus::Failed,
            succeeded: Vec::new(),
            failed,
            elapsed: Duration::ZERO,
        };
        self.events.emit_complete(&outcome);
        outcome
    }

    /// Cancel every recipient. Sessions wipe their keys immediately;
    /// recipients not yet connected never start.
    pub fn cancel_all(&self) {
        if self.cancelled.send_replace(true) {
            return;
        }
        info!(group = %self.group_id, "cancelling group transfer");
        let sessions: Vec<_> = lock(&self.sessions).iter().flatten().cloned().collect();
        for session in sessions {
            session.cancel();
        }
        if self.mode == TransferMode::Group {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                for recipient in self.recipients.clone() {
                    let connector = Arc::clone(&self.ctx.connector);
                    let envelope = SignalEnvelope::seal(
                        SignalBody::Cancel {
                            group_id: self.group_id,
                            reason: "cancelled by sender".into(),
                        },
                        self.ctx.identity.as_deref(),
                    );
                    handle.spawn(async move {
                        let sent = match envelope {
                            Ok(envelope) => {
                                connector.signal(&recipient, envelope).await.map(|_| ())
                            }
                            Err(e) => Err(e),
                        };
                        if let Err(e) = sent {
                            debug!(
                                recipient = %recipient.id,
                                error = %e,
                                "cancel notice not delivered"
                            );
                        }
                    });
                }
            }
        }
    }

    async fn drive_recipient(self: Arc<Self>, index: usize, source: FileSource) -> Result<()> {
        let recipient = self.recipients[index].clone();
        let result = self.drive(index, &recipient, &source).await;

        self.budget.release(&recipient.id);
        let mut last = self.session_at(index).map_or_else(
            || RecipientProgress::new(recipient.id.clone(), source.len()),
            |s| s.progress(),
        );
        if let Err(error) = &result {
            if !last.status.is_terminal() {
                let cancelled = matches!(
                    error,
                    FerryError::SessionTerminated | FerryError::Cancelled(_)
                );
                last.status = if cancelled {
                    RecipientStatus::Cancelled
                } else {
                    RecipientStatus::Failed
                };
            }
            warn!(error = %error, "recipient failed");
            self.events.emit_failure(RecipientFailure {
                recipient: recipient.id.clone(),
                error: error.clone(),
            });
        }
        self.record_progress(index, &last);
        result
    }

    async fn drive(
        &self,
        index: usize,
        recipient: &RecipientDescriptor,
        source: &FileSource,
    ) -> Result<()> {
        self.ensure_active()?;
        let negotiating = self.progress_with(recipient, source, RecipientStatus::Negotiating);
        self.record_progress(index, &negotiating);

        if self.mode == TransferMode::Group {
            self.invite(recipient, source).await?;
        }
        let link = self
            .until_cancelled(self.ctx.connector.connect(recipient))
            .await?;
        let session = Arc::new(RecipientSession::new(
            recipient.clone(),
            link,
            Arc::clone(&self.ctx.config),
            self.ctx.identity.clone(),
            source.len(),
        )?);
        if let Err(e) = self
            .ctx
            .registry
            .insert((self.group_id, recipient.id.clone()), Arc::clone(&session))
        {
            session.cancel();
            return Err(e);
        }
        lock(&self.sessions)[index] = Some(Arc::clone(&session));
        if *self.cancelled.borrow() {
            session.cancel();
        }

        let mut pacer = Pacer::new(self.budget.register(&recipient.id));
        let mut progress = session.subscribe();
        self.record_progress(index, &progress.current());
        let transfer = session.transfer(source, &mut pacer);
        tokio::pin!(transfer);
        let result = loop {
            tokio::select! {
                result = &mut transfer => break result,
                Some(update) = progress.next() => self.record_progress(index, &update),
            }
        };
        self.record_progress(index, &session.progress());
        result
    }

    async fn invite(&self, recipient: &RecipientDescriptor, source: &FileSource) -> Result<()> {
        let body = SignalBody::Invite(GroupInvite {
            group_id: self.group_id,
            recipient_id: recipient.id.clone(),
            sender_name: self.ctx.sender_name.clone(),
            sender_identity: self.ctx.identity.as_ref().map(|id| id.public_key()),
            file_name: source.name().to_string(),
            file_size: source.len(),
            recipient_count: self.recipient_count,
        });
        let envelope = SignalEnvelope::seal(body, self.ctx.identity.as_deref())?;
        let timeout = self.ctx.config.transfer.key_exchange_timeout();
        let reply = self
            .until_cancelled(async {
                tokio::time::timeout(timeout, self.ctx.connector.signal(recipient, envelope))
                    .await
                    .map_err(|_| FerryError::Timeout("invite response"))?
            })
            .await?
            .ok_or_else(|| FerryError::Protocol("invite not answered".into()))?;

        let body = reply.open(
            self.ctx.config.transfer.signaling_freshness(),
            SIGNALING_FUTURE_SKEW,
            recipient.identity.as_ref(),
        )?;
        if body.group_id() != self.group_id {
            return Err(FerryError::Protocol("reply for another group".into()));
        }
        match body {
            SignalBody::Join { recipient_id, .. } if *recipient_id == recipient.id => {
                debug!("recipient joined");
                Ok(())
            }
            SignalBody::Reject { reason, .. } => {
                let reason = format!("invite declined: {reason}");
                Err(FerryError::KeyExchange(reason))
            }
            _ => Err(FerryError::Protocol("unexpected invite reply".into())),
        }
    }

    fn record_progress(&self, index: usize, progress: &RecipientProgress) {
        if progress.status == RecipientStatus::Transferring {
            self.status.send_if_modified(|status| {
                let advance = matches!(*status, GroupStatus::Preparing | GroupStatus::Negotiating);
                if advance {
                    *status = GroupStatus::Transferring;
                }
                advance
            });
        }
        let report = {
            let mut aggregator = lock(&self.aggregator);
            aggregator
                .update(index, progress)
                .map(|report| (self.events.progress_ticket(), report))
        };
        if let Some((ticket, report)) = report {
            self.events.emit_progress(ticket, report);
        }
    }

    fn progress_with(
        &self,
        recipient: &RecipientDescriptor,
        source: &FileSource,
        status: RecipientStatus,
    ) -> RecipientProgress {
        let mut progress = RecipientProgress::new(recipient.id.clone(), source.len());
        progress.status = status;
        progress
    }

    fn session_at(&self, index: usize) -> Option<Arc<RecipientSession>> {
        lock(&self.sessions).get(index).cloned().flatten()
    }

    fn ensure_active(&self) -> Result<()> {
        if *self.cancelled.borrow() {
            return Err(FerryError::Cancelled("group cancelled".into()));
        }
        Ok(())
    }

    async fn until_cancelled<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut cancelled = self.cancelled.subscribe();
        tokio::select! {
            biased;
            () = async {
                let _ = cancelled.wait_for(|c| *c).await;
            } => Err(FerryError::Cancelled("group cancelled".into())),
            result = fut => result,
        }
    }

    fn set_status(&self, status: GroupStatus) {
        self.status.send_replace(status);
    }
}

impl std::fmt::Debug for GroupTransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupTransferManager")
            .field("group_id", &self.group_id)
            .field("mode", &self.mode)
            .field("recipients", &self.recipients.len())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Group size as carried in invites.
fn recipient_count(n: usize) -> Result<u32> {
    let message = format!("{n} recipients in one group");
    u32::try_from(n).map_err(|_| FerryError::validation(message))
}
