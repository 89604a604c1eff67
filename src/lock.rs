//! Checkout lock acquisition
//!
//! A failed lock aborts the export. The call is never retried and its error is
//! never swallowed: without a checkout epoch no manifest or download call is
//! valid.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, PipelineResult, RemoteError};
use crate::service::ModelService;
use crate::session::ServiceModelSessionToken;

/// Lock mode bit set sent with the lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockOptions(u32);

impl LockOptions {
    pub const NOT_SET: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const NON_EXCLUSIVE_READ_WRITE: Self = Self(128);
    pub const READ_AND_NON_EXCLUSIVE: Self = Self(129);
    pub const WRITE_AND_NON_EXCLUSIVE: Self = Self(130);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::READ_AND_NON_EXCLUSIVE
    }
}

/// Snapshot marker returned by a successful lock
///
/// Every manifest and download call in the run is pinned to this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckoutEpoch(String);

impl CheckoutEpoch {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckoutEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checkout history marker; the lock request starts from an invalid one
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryMarker(Option<String>);

impl HistoryMarker {
    pub fn invalid() -> Self {
        Self(None)
    }

    pub fn episode(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Parameters of one lock call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub options: LockOptions,
    pub allow_non_exclusive: bool,
    pub version_number: i32,
    pub history: HistoryMarker,
}

impl LockRequest {
    pub fn new(options: LockOptions, allow_non_exclusive: bool) -> Self {
        Self {
            options,
            allow_non_exclusive,
            version_number: 0,
            history: HistoryMarker::invalid(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locking,
    Locked(CheckoutEpoch),
}

/// Holds the server-side checkout lock state of one export run
///
/// The lock is released by the server when the session ends; there is no
/// explicit unlock call.
#[derive(Debug)]
pub struct LockManager {
    state: LockState,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: LockState::Unlocked,
        }
    }

    pub fn state(&self) -> &LockState {
        &self.state
    }

    /// Epoch of the held lock, if any
    pub fn epoch(&self) -> Option<&CheckoutEpoch> {
        match &self.state {
            LockState::Locked(epoch) => Some(epoch),
            _ => None,
        }
    }

    pub async fn lock(
        &mut self,
        service: &dyn ModelService,
        token: &ServiceModelSessionToken,
        options: LockOptions,
        allow_non_exclusive: bool,
    ) -> PipelineResult<CheckoutEpoch> {
        if !matches!(self.state, LockState::Unlocked) {
            return Err(PipelineError::InvalidInput(
                "model is already locked in this session".to_string(),
            ));
        }

        let request = LockRequest::new(options, allow_non_exclusive);
        self.state = LockState::Locking;

        tracing::info!(
            host = %token.location.server,
            relative_path = %token.location.relative_path,
            options = options.bits(),
            allow_non_exclusive,
            "Requesting checkout lock"
        );

        match service.lock_data(token, &request).await {
            Ok(epoch) => {
                tracing::info!(epoch = %epoch, "Checkout lock acquired");
                self.state = LockState::Locked(epoch.clone());
                Ok(epoch)
            }
            Err(err) => {
                self.state = LockState::Unlocked;
                crate::metrics::record_lock_failure();
                tracing::error!(error = %err, "Checkout lock failed");
                Err(match err {
                    RemoteError::Fault(fault) => PipelineError::RemoteLockDenied(fault),
                    RemoteError::Transport(msg) => PipelineError::TransportError(msg),
                })
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeModelService, model_token};

    #[test]
    fn test_lock_options_bits() {
        assert_eq!(
            LockOptions::READ.union(LockOptions::NON_EXCLUSIVE_READ_WRITE),
            LockOptions::READ_AND_NON_EXCLUSIVE
        );
        let options = LockOptions::READ_AND_NON_EXCLUSIVE;
        assert!(options.contains(LockOptions::READ));
        assert!(!options.contains(LockOptions::WRITE));
        assert_eq!(LockOptions::default().bits(), 129);
    }

    #[test]
    fn test_lock_request_starts_from_invalid_history() {
        let request = LockRequest::new(LockOptions::READ, true);
        assert_eq!(request.version_number, 0);
        assert_eq!(request.history.episode(), None);
    }

    #[tokio::test]
    async fn test_lock_success() {
        let service = FakeModelService::new();
        let mut manager = LockManager::new();
        assert_eq!(manager.state(), &LockState::Unlocked);

        let epoch = manager
            .lock(
                &service,
                &model_token(),
                LockOptions::READ_AND_NON_EXCLUSIVE,
                true,
            )
            .await
            .unwrap();

        assert_eq!(epoch, service.epoch());
        assert_eq!(manager.epoch(), Some(&epoch));
        assert_eq!(service.calls(), vec!["lock:129:true".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_fault_is_denied_with_detail() {
        let service =
            FakeModelService::new().with_lock_fault("Item is locked", "LockedBy=rs2\\bob");
        let mut manager = LockManager::new();

        let err = manager
            .lock(&service, &model_token(), LockOptions::READ, false)
            .await
            .unwrap_err();

        match err {
            PipelineError::RemoteLockDenied(fault) => {
                assert_eq!(fault.message, "Item is locked");
                assert_eq!(fault.detail.as_deref(), Some("LockedBy=rs2\\bob"));
            }
            other => panic!("expected RemoteLockDenied, got {:?}", other),
        }
        assert_eq!(manager.state(), &LockState::Unlocked);
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_transport_failure() {
        let service = FakeModelService::new().with_lock_transport_error("connection reset");
        let mut manager = LockManager::new();

        let err = manager
            .lock(&service, &model_token(), LockOptions::READ, true)
            .await
            .unwrap_err();

        match err {
            PipelineError::TransportError(msg) => assert_eq!(msg, "connection reset"),
            other => panic!("expected TransportError, got {:?}", other),
        }
        assert!(manager.epoch().is_none());
    }

    #[tokio::test]
    async fn test_lock_twice_rejected() {
        let service = FakeModelService::new();
        let mut manager = LockManager::new();
        let token = model_token();

        manager
            .lock(&service, &token, LockOptions::READ, true)
            .await
            .unwrap();
        let err = manager
            .lock(&service, &token, LockOptions::READ, true)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert_eq!(service.calls().len(), 1);
    }
}
