//! Shared fixtures: a seeded in-memory ledger and a scripted backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ledger::{ops, tags, MemoryLedger, Owner, Tag, TransactionNode, PROTOCOL_NAME};
use operator::{
    BackendEntry, BackendMap, FeeDistributor, InferenceBackend, PayloadFormat, Publisher,
    Registration, SettlementError, SettlementGateway, TransferEvent, WorkerContext, WorkerError,
};
use serde_json::{json, Value};

pub const OPERATOR: &str = "operator-addr";
pub const USER: &str = "user-addr";
pub const CURATOR: &str = "curator-addr";
pub const CREATOR: &str = "creator-addr";
pub const VAULT: &str = "vault-addr";
pub const SERVICE_ID: &str = "svc-tx";
pub const SERVICE_NAME: &str = "image-gen";
pub const BACKEND_URL: &str = "http://backend.local:7860";

pub fn protocol_tags() -> Vec<Tag> {
    vec![
        Tag::new(tags::PROTOCOL_NAME, PROTOCOL_NAME),
        Tag::new(tags::PROTOCOL_VERSION, "1.0"),
    ]
}

pub fn node_with(id: &str, owner: &str, extra: Vec<Tag>) -> TransactionNode {
    node_at_height(id, owner, 100, extra)
}

pub fn node_at_height(id: &str, owner: &str, height: u64, mut extra: Vec<Tag>) -> TransactionNode {
    let mut all = protocol_tags();
    all.append(&mut extra);
    TransactionNode {
        id: id.to_string(),
        owner: Owner {
            address: owner.to_string(),
            public_key: None,
        },
        tags: all,
        block_height: Some(height),
    }
}

pub fn seed_service(ledger: &MemoryLedger) {
    ledger.insert_node(node_with(
        "svc-creation",
        CURATOR,
        vec![
            Tag::new(tags::OPERATION_NAME, ops::SERVICE_CREATION),
            Tag::new(tags::SERVICE_TRANSACTION, SERVICE_ID),
            Tag::new(tags::MODEL_NAME, "stable-diffusion-xl"),
            Tag::new(tags::MODEL_CREATOR, CREATOR),
        ],
    ));
}

pub fn seed_registration(ledger: &MemoryLedger, id: &str, fee: u64) {
    ledger.insert_node(node_with(
        id,
        OPERATOR,
        vec![
            Tag::new(tags::OPERATION_NAME, ops::OPERATOR_REGISTRATION),
            Tag::new(tags::SERVICE_TRANSACTION, SERVICE_ID),
            Tag::new(tags::SERVICE_NAME, SERVICE_NAME),
            Tag::new(tags::SERVICE_CURATOR, CURATOR),
            Tag::new(tags::OPERATOR_FEE, fee.to_string()),
        ],
    ));
}

pub fn backends(format: PayloadFormat) -> BackendMap {
    let mut map = BackendMap::new();
    map.insert(
        SERVICE_ID.to_string(),
        BackendEntry {
            url: BACKEND_URL.to_string(),
            payload_format: format,
            settings: None,
        },
    );
    map
}

pub fn registration(format: PayloadFormat, fee: u64) -> Registration {
    Registration {
        id: "reg-1".to_string(),
        service_id: SERVICE_ID.to_string(),
        service_name: SERVICE_NAME.to_string(),
        curator: CURATOR.to_string(),
        model_name: "stable-diffusion-xl".to_string(),
        model_creator: CREATOR.to_string(),
        operator_fee: fee,
        backend_url: BACKEND_URL.to_string(),
        payload_format: format,
        settings: None,
    }
}

/// A paid request with its operator-cut transfer embedded, plus prompt data.
pub fn seed_paid_request(
    ledger: &MemoryLedger,
    id: &str,
    operator_cut: u64,
    extra_tags: Vec<Tag>,
    data: &[u8],
    content_type: &str,
) {
    let mut all = vec![
        Tag::new(tags::OPERATION_NAME, ops::INFERENCE_PAYMENT),
        Tag::new(tags::SERVICE_TRANSACTION, SERVICE_ID),
        Tag::new(tags::SERVICE_OPERATOR, OPERATOR),
        Tag::new(tags::CONVERSATION_IDENTIFIER, "conv-1"),
        Tag::new(tags::CONTENT_TYPE, content_type),
        Tag::new(
            tags::INPUT,
            json!({ "function": "transfer", "target": OPERATOR, "qty": operator_cut }).to_string(),
        ),
    ];
    all.extend(extra_tags);
    ledger.insert(node_with(id, USER, all), data.to_vec(), Some(content_type));
}

/// Three fee-share transfer records for one request.
pub fn seed_fee_shares(
    ledger: &MemoryLedger,
    request_id: &str,
    marketplace: u64,
    curator: u64,
    creator: u64,
) {
    for (i, (target, qty)) in [(VAULT, marketplace), (CURATOR, curator), (CREATOR, creator)]
        .iter()
        .enumerate()
    {
        ledger.insert_node(node_with(
            &format!("{request_id}-share-{i}"),
            USER,
            vec![
                Tag::new(tags::REQUEST_TRANSACTION, request_id),
                Tag::new(
                    tags::INPUT,
                    json!({ "function": "transfer", "target": target, "qty": qty }).to_string(),
                ),
            ],
        ));
    }
}

/// A request paid on the settlement chain: no embedded transfer, no fee-share
/// records, just the chain transaction reference.
pub fn seed_settlement_request(
    ledger: &MemoryLedger,
    id: &str,
    tx_hash: &str,
    extra_tags: Vec<Tag>,
    data: &[u8],
) {
    let mut all = vec![
        Tag::new(tags::OPERATION_NAME, ops::INFERENCE_PAYMENT),
        Tag::new(tags::SERVICE_TRANSACTION, SERVICE_ID),
        Tag::new(tags::SERVICE_OPERATOR, OPERATOR),
        Tag::new(tags::CONVERSATION_IDENTIFIER, "conv-1"),
        Tag::new(tags::CONTENT_TYPE, "text/plain"),
        Tag::new(tags::SETTLEMENT_TRANSACTION, tx_hash),
    ];
    all.extend(extra_tags);
    ledger.insert(node_with(id, USER, all), data.to_vec(), Some("text/plain"));
}

/// Scripted inference backend. The metadata endpoint always reports seed 42;
/// everything else pops the next scripted response.
pub struct MockBackend {
    responses: Mutex<VecDeque<Value>>,
    pub calls: Mutex<Vec<String>>,
    pub bodies: Mutex<Vec<Value>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl MockBackend {
    pub fn scripted(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            bodies: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    pub fn inference_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|url| !url.ends_with("png-info"))
            .count()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn invoke(&self, url: &str, body: Value) -> Result<Value, WorkerError> {
        self.calls.lock().unwrap().push(url.to_string());
        if url.ends_with("png-info") {
            return Ok(json!({ "info": "Steps: 20, Seed: 42, Size: 512x512" }));
        }
        self.bodies.lock().unwrap().push(body);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| WorkerError::Backend("no scripted response left".to_string()))
    }
}

/// Settlement chain double: one scripted inbound transfer per tx hash, a
/// counter of transfer lookups, and a record of every outbound send.
pub struct MockSettlement {
    transfers: Mutex<std::collections::HashMap<String, TransferEvent>>,
    pub lookups: AtomicUsize,
    pub sent: Mutex<Vec<(String, u64, u64)>>,
}

impl MockSettlement {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transfers: Mutex::new(std::collections::HashMap::new()),
            lookups: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Record an inbound payment of `amount` to the operator for `request_id`.
    pub fn record_transfer(&self, tx_hash: &str, request_id: &str, amount: u64) {
        self.transfers.lock().unwrap().insert(
            tx_hash.to_string(),
            TransferEvent {
                from: USER.to_string(),
                to: OPERATOR.to_string(),
                amount,
                memo: hex::encode(request_id.as_bytes()),
            },
        );
    }
}

#[async_trait]
impl SettlementGateway for MockSettlement {
    async fn transfer(&self, tx_hash: &str) -> Result<TransferEvent, SettlementError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.transfers
            .lock()
            .unwrap()
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| SettlementError::Rpc(format!("unknown transfer {tx_hash}")))
    }

    async fn next_nonce(&self) -> Result<u64, SettlementError> {
        Ok(0)
    }

    async fn send(&self, to: &str, amount: u64, nonce: u64) -> Result<String, SettlementError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), amount, nonce));
        Ok(format!("hash-{nonce}"))
    }
}

pub fn distributor(chain: Arc<MockSettlement>) -> Arc<FeeDistributor> {
    Arc::new(FeeDistributor::new(
        chain,
        OPERATOR.to_string(),
        VAULT.to_string(),
    ))
}

pub fn worker_context(
    ledger: Arc<MemoryLedger>,
    backend: Arc<MockBackend>,
    sealing_secret: Option<x25519_dalek::StaticSecret>,
) -> WorkerContext {
    *ledger.self_address.lock().unwrap() = OPERATOR.to_string();
    let gateway: Arc<dyn ledger::LedgerGateway> = ledger;
    WorkerContext {
        gateway: Arc::clone(&gateway),
        backend,
        publisher: Publisher::new(Arc::clone(&gateway), OPERATOR.to_string(), "test-node".to_string()),
        operator_address: OPERATOR.to_string(),
        marketplace_address: VAULT.to_string(),
        settlement: None,
        sealing_secret,
    }
}
