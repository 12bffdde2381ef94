//! Data model and gateway for the tag-indexed, append-only transaction ledger
//! that backs the Inferlay marketplace.
//!
//! Every marketplace fact — operator registrations, paid inference requests,
//! payment records, published responses — is a ledger transaction carrying
//! name/value tags. This crate provides the transaction model, a typed tag
//! accessor layer, the [`LedgerGateway`] trait over the ledger's search and
//! upload endpoints, and the query builders the operator uses to ask the
//! ledger its standard questions.

pub mod gateway;
pub mod http;
pub mod memory;
pub mod query;
pub mod types;

pub use gateway::{DataBlob, LedgerError, LedgerGateway, UploadReceipt};
pub use http::HttpLedgerGateway;
pub use memory::MemoryLedger;
pub use types::{Edge, Owner, Page, Tag, TagFilter, TagQuery, TransactionNode};

/// Protocol identity stamped on every transaction the operator reads or writes.
pub const PROTOCOL_NAME: &str = "Inferlay";

/// Operation names used in the `Operation-Name` tag.
pub mod ops {
    pub const OPERATOR_REGISTRATION: &str = "Operator Registration";
    pub const OPERATOR_CANCELLATION: &str = "Operator Cancellation";
    pub const SERVICE_CREATION: &str = "Service Creation";
    pub const INFERENCE_PAYMENT: &str = "Inference Payment";
    pub const INFERENCE_REQUEST: &str = "Inference Request";
    pub const INFERENCE_RESPONSE: &str = "Inference Response";
}

/// Canonical tag names.
pub mod tags {
    pub const PROTOCOL_NAME: &str = "Protocol-Name";
    pub const PROTOCOL_VERSION: &str = "Protocol-Version";
    pub const OPERATION_NAME: &str = "Operation-Name";
    pub const SERVICE_TRANSACTION: &str = "Service-Transaction";
    pub const SERVICE_NAME: &str = "Service-Name";
    pub const SERVICE_CURATOR: &str = "Service-Curator";
    pub const SERVICE_USER: &str = "Service-User";
    pub const SERVICE_OPERATOR: &str = "Service-Operator";
    pub const REGISTRATION_TRANSACTION: &str = "Registration-Transaction";
    pub const REQUEST_TRANSACTION: &str = "Request-Transaction";
    pub const INFERENCE_TRANSACTION: &str = "Inference-Transaction";
    pub const SEQUENCER_OWNER: &str = "Sequencer-Owner";
    /// Hash of the settlement-chain transfer paying for a request.
    pub const SETTLEMENT_TRANSACTION: &str = "Settlement-Transaction";
    pub const CONVERSATION_IDENTIFIER: &str = "Conversation-Identifier";
    pub const CONTRACT: &str = "Contract";
    pub const INPUT: &str = "Input";
    pub const OPERATOR_FEE: &str = "Operator-Fee";
    pub const OUTPUT_COUNT: &str = "N-Images";
    pub const NEGATIVE_PROMPT: &str = "Negative-Prompt";
    pub const PROMPT: &str = "Prompt";
    pub const MODEL_NAME: &str = "Model-Name";
    pub const MODEL_CREATOR: &str = "Model-Creator";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const UNIX_TIME: &str = "Unix-Time";
    pub const PRIVATE_MODE: &str = "Private-Mode";
    pub const PUBLIC_KEY: &str = "Public-Key";
    pub const ASSET_NAMES: &str = "Asset-Names";
    pub const GENERATE_ASSETS: &str = "Generate-Assets";
    pub const LICENSE_CONFIG: &str = "License-Config";
    pub const USER_CUSTOM_TAGS: &str = "User-Custom-Tags";
    pub const DESCRIPTION: &str = "Description";
    pub const INFERENCE_SEED: &str = "Inference-Seed";
    pub const TITLE: &str = "Title";
    pub const TYPE: &str = "Type";
    pub const LICENSE: &str = "License";
    pub const DERIVATION: &str = "Derivation";
    pub const COMMERCIAL_USE: &str = "Commercial-Use";
    pub const INDEXED_BY: &str = "Indexed-By";
    pub const TOPIC_AI: &str = "topic:ai-generated";
    pub const APP_NAME: &str = "App-Name";
    pub const APP_VERSION: &str = "App-Version";
    pub const CONTRACT_SRC: &str = "Contract-Src";
    pub const INIT_STATE: &str = "Init-State";
}
