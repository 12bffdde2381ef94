//! In-memory [`LedgerGateway`] used by tests and local dry runs.
//!
//! Mirrors the pagination behaviour of the HTTP gateway: results come back
//! newest first, cursors are opaque strings, and `after` resumes strictly
//! past the given cursor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::gateway::{DataBlob, LedgerError, LedgerGateway, UploadReceipt};
use crate::types::{Edge, Owner, Page, Tag, TagQuery, TransactionNode};

struct StoredTx {
    seq: u64,
    node: TransactionNode,
    data: Option<DataBlob>,
}

/// What a caller handed to [`LedgerGateway::upload`], kept for assertions.
#[derive(Clone, Debug)]
pub struct RecordedUpload {
    pub id: String,
    pub bytes: Vec<u8>,
    pub tags: Vec<Tag>,
}

#[derive(Default)]
pub struct MemoryLedger {
    txs: Mutex<Vec<StoredTx>>,
    uploads: Mutex<Vec<RecordedUpload>>,
    registered_assets: Mutex<Vec<String>>,
    seq: AtomicU64,
    fail_uploads: Mutex<bool>,
    fail_registration: Mutex<bool>,
    /// Owner attached to transactions created through `upload`.
    pub self_address: Mutex<String>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a transaction with no data payload.
    pub fn insert_node(&self, node: TransactionNode) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.txs.lock().unwrap().push(StoredTx {
            seq,
            node,
            data: None,
        });
    }

    /// Store a transaction together with its raw data.
    pub fn insert(&self, node: TransactionNode, bytes: Vec<u8>, content_type: Option<&str>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.txs.lock().unwrap().push(StoredTx {
            seq,
            node,
            data: Some(DataBlob {
                bytes,
                content_type: content_type.map(|s| s.to_string()),
            }),
        });
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        *self.fail_uploads.lock().unwrap() = fail;
    }

    pub fn set_fail_registration(&self, fail: bool) {
        *self.fail_registration.lock().unwrap() = fail;
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn registered_assets(&self) -> Vec<String> {
        self.registered_assets.lock().unwrap().clone()
    }

    fn matches(node: &TransactionNode, query: &TagQuery) -> bool {
        if !query.owners.is_empty() && !query.owners.contains(&node.owner.address) {
            return false;
        }
        query.tags.iter().all(|filter| {
            node.tags
                .iter()
                .any(|t| t.name == filter.name && filter.values.contains(&t.value))
        })
    }
}

#[async_trait]
impl LedgerGateway for MemoryLedger {
    async fn search(&self, query: &TagQuery) -> Result<Page, LedgerError> {
        let after_seq: Option<u64> = query
            .after
            .as_deref()
            .and_then(|cursor| cursor.parse().ok());

        let txs = self.txs.lock().unwrap();
        let mut matched: Vec<&StoredTx> = txs
            .iter()
            .filter(|tx| Self::matches(&tx.node, query))
            .filter(|tx| after_seq.map_or(true, |after| tx.seq < after))
            .collect();
        matched.sort_by(|a, b| b.seq.cmp(&a.seq));

        let has_next_page = matched.len() > query.first;
        let edges = matched
            .into_iter()
            .take(query.first)
            .map(|tx| Edge {
                cursor: Some(tx.seq.to_string()),
                node: tx.node.clone(),
            })
            .collect();

        Ok(Page {
            edges,
            has_next_page,
        })
    }

    async fn transaction(&self, id: &str) -> Result<Option<TransactionNode>, LedgerError> {
        let txs = self.txs.lock().unwrap();
        Ok(txs.iter().find(|tx| tx.node.id == id).map(|tx| tx.node.clone()))
    }

    async fn fetch_data(&self, id: &str) -> Result<DataBlob, LedgerError> {
        let txs = self.txs.lock().unwrap();
        txs.iter()
            .find(|tx| tx.node.id == id)
            .and_then(|tx| tx.data.clone())
            .ok_or_else(|| LedgerError::DataNotFound(id.to_string()))
    }

    async fn upload(&self, bytes: Vec<u8>, tags: Vec<Tag>) -> Result<UploadReceipt, LedgerError> {
        if *self.fail_uploads.lock().unwrap() {
            return Err(LedgerError::Upload("simulated bundler outage".to_string()));
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("upload-{seq}");
        self.uploads.lock().unwrap().push(RecordedUpload {
            id: id.clone(),
            bytes: bytes.clone(),
            tags: tags.clone(),
        });

        // Uploaded transactions become searchable, so tests can exercise
        // the already-answered path against the gateway's own responses.
        let owner = self.self_address.lock().unwrap().clone();
        self.txs.lock().unwrap().push(StoredTx {
            seq,
            node: TransactionNode {
                id: id.clone(),
                owner: Owner {
                    address: owner,
                    public_key: None,
                },
                tags,
                block_height: Some(seq),
            },
            data: Some(DataBlob {
                bytes,
                content_type: None,
            }),
        });

        Ok(UploadReceipt { id })
    }

    async fn register_asset(&self, tx_id: &str, _node_id: &str) -> Result<String, LedgerError> {
        if *self.fail_registration.lock().unwrap() {
            return Err(LedgerError::AssetRegistration(
                "simulated registrar outage".to_string(),
            ));
        }
        self.registered_assets
            .lock()
            .unwrap()
            .push(tx_id.to_string());
        Ok(format!("contract-{tx_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, owner: &str, tags: Vec<Tag>) -> TransactionNode {
        TransactionNode {
            id: id.to_string(),
            owner: Owner {
                address: owner.to_string(),
                public_key: None,
            },
            tags,
            block_height: None,
        }
    }

    #[tokio::test]
    async fn search_returns_newest_first_and_paginates() {
        let ledger = MemoryLedger::new();
        for i in 0..5 {
            ledger.insert_node(node(
                &format!("tx-{i}"),
                "alice",
                vec![Tag::new("Kind", "note")],
            ));
        }

        let query = TagQuery::new(2).tag("Kind", "note");
        let first = ledger.search(&query).await.unwrap();
        assert_eq!(first.edges.len(), 2);
        assert!(first.has_next_page);
        assert_eq!(first.edges[0].node.id, "tx-4");

        let second = ledger
            .search(&TagQuery::new(2).tag("Kind", "note").after(first.last_cursor()))
            .await
            .unwrap();
        assert_eq!(second.edges[0].node.id, "tx-2");
    }

    #[tokio::test]
    async fn owner_filter_excludes_other_authors() {
        let ledger = MemoryLedger::new();
        ledger.insert_node(node("tx-a", "alice", vec![Tag::new("Kind", "note")]));
        ledger.insert_node(node("tx-b", "bob", vec![Tag::new("Kind", "note")]));

        let page = ledger
            .search(&TagQuery::new(10).tag("Kind", "note").owner("bob"))
            .await
            .unwrap();
        assert_eq!(page.edges.len(), 1);
        assert_eq!(page.edges[0].node.id, "tx-b");
    }

    #[tokio::test]
    async fn upload_records_become_searchable() {
        let ledger = MemoryLedger::new();
        *ledger.self_address.lock().unwrap() = "operator".to_string();
        let receipt = ledger
            .upload(b"payload".to_vec(), vec![Tag::new("Kind", "answer")])
            .await
            .unwrap();

        let page = ledger
            .search(&TagQuery::new(10).tag("Kind", "answer").owner("operator"))
            .await
            .unwrap();
        assert_eq!(page.edges[0].node.id, receipt.id);
        assert_eq!(ledger.uploads().len(), 1);
    }
}
