//! The Inferlay operator engine.
//!
//! An operator serves AI inference for a tag-indexed marketplace ledger: it
//! registers against services, watches the ledger for paid requests,
//! verifies the fee splits, runs the prompts through configured HTTP
//! inference backends, and publishes the outputs back to the ledger.
//!
//! The crate is the engine only; the `inferlay-node` binary wires it to
//! configuration, keys and the real network endpoints.

pub mod backend;
pub mod coordinator;
pub mod error;
pub mod payment;
pub mod publisher;
pub mod registration;
pub mod sealing;
pub mod settlement;
pub mod worker;

pub use backend::{HttpInferenceBackend, InferenceBackend, InferenceOutput};
pub use coordinator::{Coordinator, CoordinatorConfig, PollState, ProcessedSet};
pub use error::{BootstrapError, RegistrationError, SettlementError, WorkerError};
pub use payment::{FeeSplit, PaymentParties};
pub use publisher::{PublishItem, Publisher};
pub use registration::{BackendEntry, BackendMap, PayloadFormat, Registration};
pub use settlement::{FeeDistributor, HttpSettlementGateway, SettlementGateway, TransferEvent};
pub use worker::{FulfillmentOutcome, FulfillmentReport, PaymentChannel, WorkerContext};
