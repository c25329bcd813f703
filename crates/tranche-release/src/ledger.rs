//! Ledger client collaborator and a simulated ledger.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tranche_core::{
    condition, Condition, Fulfillment, LedgerError, LedgerErrorKind, PaymentExecution, Result,
};
use uuid::Uuid;

/// The escrow-finish transaction submitted to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTransaction {
    pub execution_id: Uuid,
    pub request_id: Uuid,
    pub escrow_id: Uuid,
    pub milestone_id: Uuid,
    pub amount: u64,
    pub currency: String,
    pub condition: Condition,
    pub fulfillment: Fulfillment,
}

impl ReleaseTransaction {
    pub fn for_execution(execution: &PaymentExecution, condition: Condition, fulfillment: Fulfillment) -> Self {
        Self {
            execution_id: execution.id,
            request_id: execution.request_id,
            escrow_id: execution.escrow_id,
            milestone_id: execution.milestone_id,
            amount: execution.amount,
            currency: execution.currency.clone(),
            condition,
            fulfillment,
        }
    }

    /// Serialized blob handed to [`LedgerClient::submit`].
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// External ledger RPC.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a signed transaction blob, returning its hash.
    async fn submit(&self, signed_tx_blob: &[u8]) -> std::result::Result<String, LedgerError>;

    /// Current inclusion depth of a transaction.
    async fn confirmations(&self, tx_hash: &str) -> std::result::Result<u32, LedgerError>;
}

#[derive(Default)]
struct Simulation {
    submit_failures: VecDeque<LedgerError>,
    confirmation_failures: VecDeque<LedgerError>,
    transactions: HashMap<String, u32>,
    submit_calls: usize,
}

/// In-process ledger for development and tests.
///
/// Verifies the escrow condition like a real ledger would, derives the
/// transaction hash from the blob so resubmission is idempotent, and adds
/// `confirmations_per_poll` depth on every confirmation query.
pub struct SimulatedLedger {
    state: Mutex<Simulation>,
    confirmations_per_poll: u32,
    latency: Option<Duration>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Simulation::default()),
            confirmations_per_poll: 1,
            latency: None,
        }
    }

    /// Depth gained per confirmation query. Zero simulates a stalled transaction.
    pub fn with_confirmations_per_poll(mut self, confirmations: u32) -> Self {
        self.confirmations_per_poll = confirmations;
        self
    }

    /// Delay every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Simulation> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next submission with `error`.
    pub fn fail_next_submit(&self, error: LedgerError) {
        self.lock().submit_failures.push_back(error);
    }

    /// Fail the next confirmation query with `error`.
    pub fn fail_next_confirmations(&self, error: LedgerError) {
        self.lock().confirmation_failures.push_back(error);
    }

    /// Distinct transactions accepted.
    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    /// Submit calls received, failed ones included.
    pub fn submit_calls(&self) -> usize {
        self.lock().submit_calls
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn submit(&self, signed_tx_blob: &[u8]) -> std::result::Result<String, LedgerError> {
        self.delay().await;

        let mut state = self.lock();
        state.submit_calls += 1;
        if let Some(error) = state.submit_failures.pop_front() {
            return Err(error);
        }

        let tx: ReleaseTransaction = serde_json::from_slice(signed_tx_blob)
            .map_err(|e| LedgerError::new(LedgerErrorKind::Rejected, format!("malformed transaction: {}", e)))?;
        if !condition::validate(&tx.condition, &tx.fulfillment, tx.escrow_id, tx.milestone_id) {
            return Err(LedgerError::new(
                LedgerErrorKind::ConditionMismatch,
                "fulfillment does not satisfy escrow condition",
            ));
        }

        let tx_hash = hex::encode_upper(Sha256::digest(signed_tx_blob));
        state.transactions.entry(tx_hash.clone()).or_insert(0);
        Ok(tx_hash)
    }

    async fn confirmations(&self, tx_hash: &str) -> std::result::Result<u32, LedgerError> {
        self.delay().await;

        let mut state = self.lock();
        if let Some(error) = state.confirmation_failures.pop_front() {
            return Err(error);
        }

        let step = self.confirmations_per_poll;
        let depth = state
            .transactions
            .get_mut(tx_hash)
            .ok_or_else(|| LedgerError::new(LedgerErrorKind::Rejected, format!("unknown transaction {}", tx_hash)))?;
        *depth = depth.saturating_add(step);
        Ok(*depth)
    }
}
