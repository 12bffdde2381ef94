//! Secondary-chain fee settlement.
//!
//! Some users pay on an EVM-style settlement chain instead of publishing
//! ledger transfer records. The gateway trait below covers the three calls
//! the operator needs; the distributor verifies inbound payments and
//! forwards the marketplace and curator cuts after fulfillment.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::SettlementError;
use crate::payment::FeeSplit;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransferEvent {
    pub from: String,
    pub to: String,
    pub amount: u64,
    /// Hex-encoded ledger request id the payer attached.
    pub memo: String,
}

#[async_trait]
pub trait SettlementGateway: Send + Sync {
    async fn transfer(&self, tx_hash: &str) -> Result<TransferEvent, SettlementError>;
    async fn next_nonce(&self) -> Result<u64, SettlementError>;
    async fn send(&self, to: &str, amount: u64, nonce: u64) -> Result<String, SettlementError>;
}

/// Settlement service spoken over plain HTTP/JSON.
pub struct HttpSettlementGateway {
    client: reqwest::Client,
    base_url: String,
    operator_address: String,
}

impl HttpSettlementGateway {
    pub fn new(base_url: String, operator_address: String) -> Result<Self, SettlementError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|err| SettlementError::Rpc(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            operator_address,
        })
    }
}

#[async_trait]
impl SettlementGateway for HttpSettlementGateway {
    async fn transfer(&self, tx_hash: &str) -> Result<TransferEvent, SettlementError> {
        self.client
            .get(format!("{}/transfer/{tx_hash}", self.base_url))
            .send()
            .await
            .map_err(|err| SettlementError::Rpc(err.to_string()))?
            .json()
            .await
            .map_err(|err| SettlementError::Rpc(err.to_string()))
    }

    async fn next_nonce(&self) -> Result<u64, SettlementError> {
        let value: serde_json::Value = self
            .client
            .get(format!(
                "{}/nonce/{}",
                self.base_url, self.operator_address
            ))
            .send()
            .await
            .map_err(|err| SettlementError::Rpc(err.to_string()))?
            .json()
            .await
            .map_err(|err| SettlementError::Rpc(err.to_string()))?;
        value
            .get("nonce")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| SettlementError::Rpc("nonce missing from response".to_string()))
    }

    async fn send(&self, to: &str, amount: u64, nonce: u64) -> Result<String, SettlementError> {
        let value: serde_json::Value = self
            .client
            .post(format!("{}/send", self.base_url))
            .json(&serde_json::json!({
                "from": self.operator_address,
                "to": to,
                "amount": amount,
                "nonce": nonce,
            }))
            .send()
            .await
            .map_err(|err| SettlementError::Rpc(err.to_string()))?
            .json()
            .await
            .map_err(|err| SettlementError::Rpc(err.to_string()))?;
        value
            .get("txHash")
            .and_then(serde_json::Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| SettlementError::Rpc("txHash missing from response".to_string()))
    }
}

pub struct FeeDistributor {
    gateway: Arc<dyn SettlementGateway>,
    operator_address: String,
    marketplace_address: String,
    /// Next nonce to claim. Guarded so two cuts sent in the same settlement
    /// window can never collide or double-submit.
    next_nonce: Mutex<Option<u64>>,
}

impl FeeDistributor {
    pub fn new(
        gateway: Arc<dyn SettlementGateway>,
        operator_address: String,
        marketplace_address: String,
    ) -> Self {
        Self {
            gateway,
            operator_address,
            marketplace_address,
            next_nonce: Mutex::new(None),
        }
    }

    /// Check a settlement-chain payment against one request.
    ///
    /// The transfer memo must decode back to the request id, the recipient
    /// must be this operator, and the amount must cover the effective fee.
    pub async fn verify(
        &self,
        tx_hash: &str,
        request_id: &str,
        effective_fee: u64,
    ) -> Result<bool, SettlementError> {
        let event = self.gateway.transfer(tx_hash).await?;

        let memo_bytes =
            hex::decode(event.memo.trim_start_matches("0x")).map_err(|err| {
                SettlementError::Memo(format!("memo is not hex: {err}"))
            })?;
        let referenced = String::from_utf8(memo_bytes)
            .map_err(|err| SettlementError::Memo(format!("memo is not utf-8: {err}")))?;

        Ok(referenced == request_id
            && event.to == self.operator_address
            && event.amount >= effective_fee)
    }

    /// Forward the marketplace and curator cuts of one settled fee.
    ///
    /// Runs off the response path; callers spawn it after the response is
    /// durably published. Nonces come from a single guarded counter so the
    /// two sends are strictly ordered.
    pub async fn distribute(
        &self,
        split: FeeSplit,
        effective_fee: u64,
        curator_address: &str,
    ) -> Result<(), SettlementError> {
        let amounts = split.amounts(effective_fee);
        let cuts = [
            (self.marketplace_address.as_str(), amounts.marketplace),
            (curator_address, amounts.curator),
        ];

        let mut guard = self.next_nonce.lock().await;
        let mut nonce = match *guard {
            Some(n) => n,
            None => self.gateway.next_nonce().await?,
        };

        for (to, amount) in cuts {
            if amount == 0 {
                continue;
            }
            match self.gateway.send(to, amount, nonce).await {
                Ok(tx_hash) => {
                    info!(%to, amount, nonce, %tx_hash, "fee cut forwarded");
                    nonce += 1;
                }
                Err(err) => {
                    // Keep the nonce unconsumed so the retry reuses it.
                    warn!(%to, amount, nonce, %err, "fee cut failed");
                    *guard = Some(nonce);
                    return Err(err);
                }
            }
        }

        *guard = Some(nonce);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MockChain {
        event: TransferEvent,
        sent: StdMutex<Vec<(String, u64, u64)>>,
        fail_sends_to: Option<String>,
    }

    impl MockChain {
        fn with_event(event: TransferEvent) -> Self {
            Self {
                event,
                sent: StdMutex::new(Vec::new()),
                fail_sends_to: None,
            }
        }
    }

    #[async_trait]
    impl SettlementGateway for MockChain {
        async fn transfer(&self, _tx_hash: &str) -> Result<TransferEvent, SettlementError> {
            Ok(self.event.clone())
        }

        async fn next_nonce(&self) -> Result<u64, SettlementError> {
            Ok(7)
        }

        async fn send(&self, to: &str, amount: u64, nonce: u64) -> Result<String, SettlementError> {
            if self.fail_sends_to.as_deref() == Some(to) {
                return Err(SettlementError::Rpc("simulated outage".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), amount, nonce));
            Ok(format!("hash-{nonce}"))
        }
    }

    fn event_for(request_id: &str, to: &str, amount: u64) -> TransferEvent {
        TransferEvent {
            from: "payer".to_string(),
            to: to.to_string(),
            amount,
            memo: hex::encode(request_id.as_bytes()),
        }
    }

    fn distributor(chain: MockChain) -> FeeDistributor {
        FeeDistributor::new(
            Arc::new(chain),
            "op".to_string(),
            "vault".to_string(),
        )
    }

    #[tokio::test]
    async fn verify_matches_memo_recipient_and_amount() {
        let d = distributor(MockChain::with_event(event_for("req-1", "op", 400)));
        assert!(d.verify("0xabc", "req-1", 400).await.unwrap());
        assert!(!d.verify("0xabc", "req-2", 400).await.unwrap());
        assert!(!d.verify("0xabc", "req-1", 401).await.unwrap());

        let d = distributor(MockChain::with_event(event_for("req-1", "someone-else", 400)));
        assert!(!d.verify("0xabc", "req-1", 400).await.unwrap());
    }

    #[tokio::test]
    async fn garbage_memo_is_a_memo_error() {
        let mut event = event_for("req-1", "op", 400);
        event.memo = "zz-not-hex".to_string();
        let d = distributor(MockChain::with_event(event));
        assert!(matches!(
            d.verify("0xabc", "req-1", 400).await,
            Err(SettlementError::Memo(_))
        ));
    }

    #[tokio::test]
    async fn distribute_uses_strictly_increasing_nonces() {
        let chain = Arc::new(MockChain::with_event(event_for("req-1", "op", 400)));
        let d = FeeDistributor::new(
            Arc::clone(&chain) as Arc<dyn SettlementGateway>,
            "op".to_string(),
            "vault".to_string(),
        );

        let split = FeeSplit::for_protocol_version("1.0");
        d.distribute(split, 400, "curator").await.unwrap();
        d.distribute(split, 400, "curator").await.unwrap();

        let sent = chain.sent.lock().unwrap();
        // 0.15 * 400 to the vault, 0.025 * 400 to the curator, twice over.
        assert_eq!(
            *sent,
            vec![
                ("vault".to_string(), 60, 7),
                ("curator".to_string(), 10, 8),
                ("vault".to_string(), 60, 9),
                ("curator".to_string(), 10, 10),
            ]
        );
    }

    #[tokio::test]
    async fn failed_send_keeps_the_nonce_for_retry() {
        let chain = Arc::new(MockChain {
            event: event_for("req-1", "op", 400),
            sent: StdMutex::new(Vec::new()),
            fail_sends_to: Some("curator".to_string()),
        });
        let d = FeeDistributor::new(
            Arc::clone(&chain) as Arc<dyn SettlementGateway>,
            "op".to_string(),
            "vault".to_string(),
        );

        let split = FeeSplit::for_protocol_version("1.0");
        assert!(d.distribute(split, 400, "curator").await.is_err());

        // The vault cut went out with nonce 7; the failed curator send left
        // nonce 8 unconsumed for the next attempt.
        d.distribute(split, 400, "vault-2").await.unwrap();
        let sent = chain.sent.lock().unwrap();
        assert_eq!(sent[0], ("vault".to_string(), 60, 7));
        assert_eq!(sent[1], ("vault".to_string(), 60, 8));
        assert_eq!(sent[2], ("vault-2".to_string(), 10, 9));
    }
}
