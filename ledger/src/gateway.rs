use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Page, Tag, TagQuery, TransactionNode};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger http error: {0}")]
    Http(String),
    #[error("malformed gateway response: {0}")]
    Malformed(String),
    #[error("missing required tag '{0}'")]
    MissingTag(String),
    #[error("transaction data not found: {0}")]
    DataNotFound(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("asset registration failed: {0}")]
    AssetRegistration(String),
}

/// Raw transaction payload bytes plus the content type the store reported.
#[derive(Clone, Debug)]
pub struct DataBlob {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl DataBlob {
    /// Payload interpreted as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Receipt returned by the storage network for an uploaded item.
#[derive(Clone, Debug)]
pub struct UploadReceipt {
    pub id: String,
}

/// Query/append primitive over the tag-indexed transaction store.
///
/// Everything the operator knows about the marketplace flows through this
/// trait: registration discovery, payment lookups, already-answered checks,
/// conversation history, and result publication.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Tag-filtered, cursor-paginated search, newest blocks first.
    async fn search(&self, query: &TagQuery) -> Result<Page, LedgerError>;

    /// Fetch a single transaction by id, if it exists.
    async fn transaction(&self, id: &str) -> Result<Option<TransactionNode>, LedgerError>;

    /// Fetch the raw data payload of a transaction.
    async fn fetch_data(&self, id: &str) -> Result<DataBlob, LedgerError>;

    /// Upload bytes with the given tags to the storage network.
    async fn upload(&self, bytes: Vec<u8>, tags: Vec<Tag>) -> Result<UploadReceipt, LedgerError>;

    /// Register an uploaded transaction as a tradeable asset.
    ///
    /// Returns the contract transaction id. Callers treat failures here as
    /// non-fatal: the underlying content is already durably stored.
    async fn register_asset(&self, tx_id: &str, node_id: &str) -> Result<String, LedgerError>;
}
