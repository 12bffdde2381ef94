//! The dispatch coordinator: the poll loop that turns paid ledger requests
//! into bounded, per-registration-serialized worker runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ledger::{query, tags, LedgerError, LedgerGateway, TransactionNode};
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::payment::{self, FeeSplit};
use crate::registration::Registration;
use crate::settlement::FeeDistributor;
use crate::worker::{self, FulfillmentOutcome, FulfillmentReport, PaymentChannel, WorkerContext};

/// Request ids already fulfilled this process lifetime. Written only by the
/// coordinator; workers hold read access for the in-mutex re-check.
pub type ProcessedSet = Arc<RwLock<HashSet<String>>>;

/// One active registration plus the mutex serializing its dispatches.
pub struct RegistrationHandle {
    pub registration: Registration,
    pub lock: Mutex<()>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Fetching,
    Filtering,
    Dispatching,
    Sleeping,
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    /// Requests below this block height are never considered.
    pub start_block: Option<u64>,
}

enum DispatchMessage {
    Finished {
        request_id: String,
        result: Result<FulfillmentReport, WorkerError>,
    },
    /// Another worker fulfilled the id while this one waited on the
    /// registration mutex.
    Superseded { request_id: String },
}

struct Candidate {
    node: TransactionNode,
    handle: Arc<RegistrationHandle>,
}

pub struct Coordinator {
    gateway: Arc<dyn LedgerGateway>,
    worker: Arc<WorkerContext>,
    distributor: Option<Arc<FeeDistributor>>,
    handles: Arc<DashMap<String, Arc<RegistrationHandle>>>,
    processed: ProcessedSet,
    pool: Arc<Semaphore>,
    operator_address: String,
    config: CoordinatorConfig,
    state: PollState,
}

impl Coordinator {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        worker: Arc<WorkerContext>,
        distributor: Option<Arc<FeeDistributor>>,
        registrations: Vec<Registration>,
        operator_address: String,
        config: CoordinatorConfig,
    ) -> Self {
        let pool_size = registrations.len().min(num_cpus::get()).max(1);
        let handles = Arc::new(DashMap::new());
        for registration in registrations {
            handles.insert(
                registration.service_id.clone(),
                Arc::new(RegistrationHandle {
                    registration,
                    lock: Mutex::new(()),
                }),
            );
        }
        info!(
            registrations = handles.len(),
            pool = pool_size,
            "coordinator ready"
        );
        Self {
            gateway,
            worker,
            distributor,
            handles,
            processed: Arc::new(RwLock::new(HashSet::new())),
            pool: Arc::new(Semaphore::new(pool_size)),
            operator_address,
            config,
            state: PollState::Idle,
        }
    }

    pub fn processed(&self) -> ProcessedSet {
        Arc::clone(&self.processed)
    }

    /// Poll forever. Cycle-level errors are logged, never fatal.
    pub async fn run(&mut self) {
        loop {
            if let Err(err) = self.cycle().await {
                error!(%err, "poll cycle failed");
            }
            self.set_state(PollState::Sleeping);
            tokio::time::sleep(self.config.poll_interval).await;
            self.set_state(PollState::Idle);
        }
    }

    /// One full poll cycle. Returns how many requests were fulfilled.
    pub async fn cycle(&mut self) -> Result<usize, LedgerError> {
        self.set_state(PollState::Fetching);
        let inbound = self.fetch_inbound().await?;

        self.set_state(PollState::Filtering);
        let candidates = self.filter_candidates(inbound).await;
        if candidates.is_empty() {
            return Ok(0);
        }

        self.set_state(PollState::Dispatching);
        let dispatched = candidates.len();
        let (tx, mut rx) = mpsc::channel(dispatched);
        for candidate in candidates {
            self.dispatch(candidate, tx.clone());
        }
        drop(tx);

        let mut fulfilled = 0usize;
        while let Some(message) = rx.recv().await {
            match message {
                DispatchMessage::Finished { request_id, result } => match result {
                    Ok(report) => {
                        self.processed.write().await.insert(request_id);
                        if let FulfillmentOutcome::Fulfilled { .. } = report.outcome {
                            fulfilled += 1;
                            self.settle(&report);
                        }
                    }
                    Err(err) => {
                        warn!(request = %request_id, %err, "request left for next cycle");
                    }
                },
                DispatchMessage::Superseded { request_id } => {
                    debug!(request = %request_id, "superseded while queued");
                }
            }
        }
        debug!(dispatched, fulfilled, "cycle complete");
        Ok(fulfilled)
    }

    /// Fetch every paid request addressed to an active registration,
    /// following pagination until exhausted or past the start block.
    async fn fetch_inbound(&self) -> Result<Vec<TransactionNode>, LedgerError> {
        let service_ids: Vec<String> =
            self.handles.iter().map(|e| e.key().clone()).collect();

        let mut inbound = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .gateway
                .search(&query::inbound_requests(
                    &self.operator_address,
                    service_ids.clone(),
                    cursor,
                ))
                .await?;

            let mut past_start = false;
            for edge in &page.edges {
                if let (Some(start), Some(height)) =
                    (self.config.start_block, edge.node.block_height)
                {
                    // Height-descending pages, so everything after this
                    // point predates the configured start.
                    if height < start {
                        past_start = true;
                        break;
                    }
                }
                inbound.push(edge.node.clone());
            }

            if past_start || !page.has_next_page {
                break;
            }
            cursor = page.last_cursor();
            if cursor.is_none() {
                break;
            }
        }
        Ok(inbound)
    }

    /// Drop processed ids, resolve registrations, and reject requests whose
    /// embedded transfer does not cover the operator's own cut.
    async fn filter_candidates(&self, inbound: Vec<TransactionNode>) -> Vec<Candidate> {
        let processed = self.processed.read().await;
        let mut candidates = Vec::new();
        for node in inbound {
            if processed.contains(&node.id) {
                continue;
            }
            let Some(service_id) = node.tag(tags::SERVICE_TRANSACTION) else {
                warn!(request = %node.id, "request without a service reference");
                continue;
            };
            let Some(handle) = self.handles.get(service_id).map(|e| Arc::clone(e.value()))
            else {
                debug!(request = %node.id, service = service_id, "no active registration");
                continue;
            };

            let registration = &handle.registration;
            let count = worker::requested_count(&node, registration.payload_format);
            let effective_fee = payment::effective_fee(
                registration.operator_fee,
                registration.payload_format,
                count,
            );
            // Settlement-paid requests carry no embedded ledger transfer;
            // the worker verifies their whole fee against the chain instead.
            let settlement_paid = node.tag(tags::SETTLEMENT_TRANSACTION).is_some();
            if !settlement_paid
                && !payment::operator_cut_covered(&node, &self.operator_address, effective_fee)
            {
                warn!(request = %node.id, "operator cut not covered");
                continue;
            }

            candidates.push(Candidate { node, handle });
        }
        candidates
    }

    fn dispatch(&self, candidate: Candidate, tx: mpsc::Sender<DispatchMessage>) {
        let pool = Arc::clone(&self.pool);
        let processed = Arc::clone(&self.processed);
        let worker = Arc::clone(&self.worker);
        let Candidate { node, handle } = candidate;

        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            let _serial = handle.lock.lock().await;

            // The id may have been fulfilled by the dispatch we just
            // waited behind.
            if processed.read().await.contains(&node.id) {
                let _ = tx
                    .send(DispatchMessage::Superseded {
                        request_id: node.id,
                    })
                    .await;
                return;
            }

            let result = worker.process_request(&handle.registration, &node.id).await;
            let _ = tx
                .send(DispatchMessage::Finished {
                    request_id: node.id,
                    result,
                })
                .await;
        });
    }

    /// Forward fee cuts on the settlement chain, off the response path.
    ///
    /// Only settlement-paid fees sit in the operator's wallet; ledger-paid
    /// requests already carried their shares as transfer records.
    fn settle(&self, report: &FulfillmentReport) {
        if report.payment != PaymentChannel::Settlement {
            return;
        }
        let Some(distributor) = self.distributor.as_ref().map(Arc::clone) else {
            return;
        };
        let Some(curator) = self
            .handles
            .get(&report.service_id)
            .map(|e| e.registration.curator.clone())
        else {
            return;
        };
        let split = FeeSplit::for_protocol_version(&report.protocol_version);
        let effective_fee = report.effective_fee;
        let request_id = report.request_id.clone();
        tokio::spawn(async move {
            if let Err(err) = distributor.distribute(split, effective_fee, &curator).await {
                warn!(request = %request_id, %err, "fee distribution failed");
            }
        });
    }

    fn set_state(&mut self, state: PollState) {
        if self.state != state {
            debug!(?state, "poll state");
            self.state = state;
        }
    }
}
