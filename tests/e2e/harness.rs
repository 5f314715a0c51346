//! Test harness that assembles a gate over mock collaborators.

use super::ledger::MockLedger;
use async_trait::async_trait;
use paygate::ledger::LedgerClient;
use paygate::payment::{MembershipGateway, Notifier};
use paygate::{
    CycleOutcome, CycleReport, GateBuilder, GateConfig, PaymentRequest, ReferenceToken,
    RequestStatus, RunningGate, UserId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// Payment address used by every harness.
pub const GATE_ADDRESS: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";

/// Confirmations required before a transfer is matched.
pub const MIN_CONFIRMATIONS: u64 = 32;

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Gate error
    #[error("Gate error: {0}")]
    Gate(#[from] paygate::Error),

    /// Temporary directory error
    #[error("Temp dir error: {0}")]
    TempDir(#[from] std::io::Error),

    /// The run-lock was held
    #[error("Cycle skipped")]
    Skipped,
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Membership gateway that records every grant and message.
#[derive(Default)]
pub struct RecordingGateway {
    grants: Mutex<HashMap<UserId, usize>>,
    messages: Mutex<Vec<(UserId, String)>>,
    unreachable: AtomicBool,
}

impl RecordingGateway {
    /// Number of successful grants issued to `user_id`.
    pub fn grants_for(&self, user_id: UserId) -> usize {
        self.grants.lock().get(&user_id).copied().unwrap_or_default()
    }

    /// Messages delivered to `user_id`.
    pub fn messages_for(&self, user_id: UserId) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Make the channel unreachable, or reachable again.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl MembershipGateway for RecordingGateway {
    async fn grant_member(&self, user_id: UserId) -> paygate::Result<()> {
        tokio::task::yield_now().await;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(paygate::Error::Membership("channel unreachable".to_string()));
        }
        *self.grants.lock().entry(user_id).or_default() += 1;
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingGateway {
    async fn notify(&self, user_id: UserId, message: &str) -> paygate::Result<()> {
        self.messages.lock().push((user_id, message.to_string()));
        Ok(())
    }
}

/// A gate over a temporary directory, a [`MockLedger`] and a
/// [`RecordingGateway`].
///
/// The collaborators outlive the gate, so [`TestHarness::restart`] models a
/// process restart over the same ledger and state directory.
pub struct TestHarness {
    dir: TempDir,
    config: GateConfig,
    ledger: Arc<MockLedger>,
    gateway: Arc<RecordingGateway>,
    gate: Option<RunningGate>,
}

impl TestHarness {
    /// Create and build a gate with default pricing (0.01 SOL).
    ///
    /// # Errors
    ///
    /// Returns an error if the gate fails to build.
    pub async fn setup() -> Result<Self> {
        Self::setup_with(|_| {}).await
    }

    /// Create and build a gate after `configure` adjusts the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate fails to build.
    pub async fn setup_with(configure: impl FnOnce(&mut GateConfig)) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = GateConfig {
            root_dir: dir.path().to_path_buf(),
            ..GateConfig::default()
        };
        config.ledger.payment_address = GATE_ADDRESS.to_string();
        config.ledger.min_confirmations = MIN_CONFIRMATIONS;
        configure(&mut config);

        let mut harness = Self {
            dir,
            config,
            ledger: Arc::new(MockLedger::new(GATE_ADDRESS)),
            gateway: Arc::new(RecordingGateway::default()),
            gate: None,
        };
        harness.start().await?;
        Ok(harness)
    }

    async fn start(&mut self) -> Result<()> {
        let gate = GateBuilder::new(self.config.clone())
            .with_ledger(Arc::clone(&self.ledger) as Arc<dyn LedgerClient>)
            .with_membership(
                Arc::clone(&self.gateway) as Arc<dyn MembershipGateway>,
                Arc::clone(&self.gateway) as Arc<dyn Notifier>,
            )
            .build()
            .await?;
        self.gate = Some(gate);
        Ok(())
    }

    /// Drop the running gate and build a fresh one over the same state.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate fails to rebuild.
    pub async fn restart(&mut self) -> Result<()> {
        info!("Restarting gate over {}", self.dir.path().display());
        self.gate = None;
        self.start().await
    }

    /// The running gate.
    pub fn gate(&self) -> &RunningGate {
        self.gate
            .as_ref()
            .unwrap_or_else(|| unreachable!("gate is rebuilt before use"))
    }

    /// The gate's state directory.
    pub fn root_dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// The shared ledger.
    pub fn ledger(&self) -> &MockLedger {
        &self.ledger
    }

    /// The shared membership gateway.
    pub fn gateway(&self) -> &RecordingGateway {
        &self.gateway
    }

    /// Open (or reuse) a payment request for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be persisted.
    pub fn request(&self, user_id: UserId) -> Result<PaymentRequest> {
        Ok(self.gate().intake().open_request(user_id)?)
    }

    /// Current status of the request holding `token`.
    pub fn status(&self, user_id: UserId, token: &ReferenceToken) -> Option<RequestStatus> {
        self.gate()
            .intake()
            .store()
            .latest_for_user(user_id)
            .filter(|r| &r.reference_token == token)
            .map(|r| r.status)
    }

    /// Bury everything on the ledger under enough confirmations.
    pub fn confirm(&self) {
        self.ledger.advance(MIN_CONFIRMATIONS);
    }

    /// Run one cycle that must not be skipped.
    ///
    /// # Errors
    ///
    /// Returns fatal gate errors, or [`HarnessError::Skipped`].
    pub async fn cycle(&self) -> Result<CycleReport> {
        match self.gate().run_once().await? {
            CycleOutcome::Completed(report) => Ok(report),
            CycleOutcome::Skipped => Err(HarnessError::Skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_error_display() {
        let err = HarnessError::Skipped;
        assert!(err.to_string().contains("skipped"));
    }
}
