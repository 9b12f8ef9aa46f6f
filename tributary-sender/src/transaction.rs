//! Transaction coordinator.
//!
//! Transaction control calls are executed by the producer worker, the same
//! thread that dispatches every record and processes every acknowledgement
//! for the handle. Program order between `begin`, sends, `send_offsets` and
//! `commit`/`abort` therefore carries over to the client unchanged.

use crate::handle::ProducerHandle;
use std::fmt;
use std::sync::Arc;
use tributary_core::{Result, TransactionOffsets};

/// Callback notified with `true` after a commit and `false` after an abort.
pub type TransactionObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// Transaction state of a producer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransactionState {
    /// No transaction is open
    #[default]
    None = 0,
    /// A transaction is open and accepts sends
    Active = 1,
    /// A commit has been issued and is awaiting confirmation
    Committing = 2,
    /// An abort has been issued and is awaiting confirmation
    Aborting = 3,
}

impl TransactionState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Active,
            2 => Self::Committing,
            3 => Self::Aborting,
            _ => Self::None,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Active => "ACTIVE",
            Self::Committing => "COMMITTING",
            Self::Aborting => "ABORTING",
        };
        f.write_str(name)
    }
}

/// Transaction control request executed on the producer worker.
#[derive(Debug)]
pub(crate) enum TransactionOp {
    Begin,
    SendOffsets { offsets: TransactionOffsets, consumer_group_id: String },
    Commit,
    Abort,
}

impl TransactionOp {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::SendOffsets { .. } => "sendOffsets",
            Self::Commit => "commit",
            Self::Abort => "abort",
        }
    }
}

/// Controls transactions of a transactional sender.
///
/// Obtained from [`KafkaSender::transaction_manager`](crate::KafkaSender::transaction_manager).
/// A transactional producer serves a single logical flow: concurrent use from
/// several tasks is only guarded by the state checks below.
#[derive(Clone)]
pub struct TransactionManager {
    handle: Arc<ProducerHandle>,
    scheduler: tokio::runtime::Handle,
}

impl TransactionManager {
    pub(crate) fn new(handle: Arc<ProducerHandle>, scheduler: tokio::runtime::Handle) -> Self {
        Self { handle, scheduler }
    }

    /// Begin a transaction.
    ///
    /// # Errors
    /// Returns [`tributary_core::Error::IllegalState`] if a transaction is
    /// already open, or the client's error if the broker rejects the call.
    pub async fn begin(&self) -> Result<()> {
        self.handle.transaction(TransactionOp::Begin).await
    }

    /// Register consumer offsets with the open transaction.
    ///
    /// An empty offset map succeeds without contacting the broker.
    ///
    /// # Errors
    /// Returns [`tributary_core::Error::IllegalState`] if no transaction is
    /// open, or the client's error if the broker rejects the offsets.
    pub async fn send_offsets(
        &self,
        offsets: TransactionOffsets,
        consumer_group_id: impl Into<String>,
    ) -> Result<()> {
        self.handle
            .transaction(TransactionOp::SendOffsets {
                offsets,
                consumer_group_id: consumer_group_id.into(),
            })
            .await
    }

    /// Commit the open transaction and notify the completion observer.
    ///
    /// # Errors
    /// Returns [`tributary_core::Error::IllegalState`] if no transaction is
    /// open. If the client fails to commit, the transaction stays open and
    /// must be aborted.
    pub async fn commit(&self) -> Result<()> {
        self.handle.transaction(TransactionOp::Commit).await
    }

    /// Abort the open transaction and notify the completion observer.
    ///
    /// # Errors
    /// Returns [`tributary_core::Error::IllegalState`] if no transaction is open.
    pub async fn abort(&self) -> Result<()> {
        self.handle.transaction(TransactionOp::Abort).await
    }

    /// Register the transaction completion observer, replacing any previous one.
    pub fn transaction_complete<F>(&self, observer: F) -> &Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.handle.set_observer(Arc::new(observer));
        self
    }

    /// Current transaction state as last published by the worker.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.handle.transaction_state()
    }

    /// The transactional id of the producer.
    #[must_use]
    pub fn transactional_id(&self) -> &str {
        self.handle.transactional_id().unwrap_or_default()
    }

    /// Runtime on which the sender delivers results; use it to schedule
    /// follow-up work that must not race the transaction flow.
    #[must_use]
    pub const fn scheduler(&self) -> &tokio::runtime::Handle {
        &self.scheduler
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactional_id", &self.transactional_id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            TransactionState::None,
            TransactionState::Active,
            TransactionState::Committing,
            TransactionState::Aborting,
        ] {
            assert_eq!(TransactionState::from_u8(state as u8), state);
        }
        assert_eq!(TransactionState::from_u8(200), TransactionState::None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::Committing.to_string(), "COMMITTING");
        assert_eq!(TransactionState::default(), TransactionState::None);
    }
}
