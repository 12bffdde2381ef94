use ledger::LedgerError;
use thiserror::Error;

/// Startup failures. Any of these means the node cannot serve and should
/// exit with a non-zero status instead of limping along.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no usable registrations found for operator {0}")]
    NoRegistrations(String),

    #[error("ledger unavailable during startup: {0}")]
    Ledger(#[from] LedgerError),
}

/// Why a single registration was dropped during discovery. The remaining
/// registrations are unaffected.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration {0} was cancelled")]
    Cancelled(String),

    #[error("no backend configured for service {0}")]
    NoBackend(String),

    #[error("service declaration for {0} could not be resolved: {1}")]
    UnresolvedService(String, LedgerError),

    #[error("registration {0} carries an invalid operator fee: {1:?}")]
    InvalidFee(String, Option<String>),
}

/// Per-request processing failures. None of these are fatal to the node;
/// the request stays eligible for the next poll cycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("request {0} is no longer present on the ledger")]
    RequestVanished(String),

    #[error("request {id} is malformed: {reason}")]
    Malformed { id: String, reason: String },

    #[error("payment rejected for request {id}: {reason}")]
    PaymentRejected { id: String, reason: String },

    #[error("inference backend failed: {0}")]
    Backend(String),

    #[error("response upload failed: {0}")]
    Publish(LedgerError),

    #[error("sealed payload could not be opened: {0}")]
    Unseal(String),

    #[error("settlement chain check failed: {0}")]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl WorkerError {
    pub fn malformed(id: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Secondary-chain settlement failures.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("settlement rpc: {0}")]
    Rpc(String),

    #[error("transfer memo is not a valid request reference: {0}")]
    Memo(String),
}
