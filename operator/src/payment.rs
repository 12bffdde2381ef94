//! Fee-split rules and payment verification against ledger transfer records.

use ledger::{query, tags, LedgerGateway, TransactionNode};
use serde_json::Value;
use tracing::debug;

use crate::error::WorkerError;
use crate::registration::PayloadFormat;

/// Share of the effective fee the operator itself must have been sent.
pub const OPERATOR_SHARE: f64 = 0.80;

/// Fractional fee shares owed to the non-operator parties.
///
/// The marketplace cut is constant across protocol versions; the curator
/// and creator cuts changed between the 1.x and 2.x tag schemas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeeSplit {
    pub marketplace: f64,
    pub curator: f64,
    pub creator: f64,
}

impl FeeSplit {
    pub fn for_protocol_version(version: &str) -> Self {
        if version.starts_with("1.") {
            Self {
                marketplace: 0.15,
                curator: 0.025,
                creator: 0.025,
            }
        } else {
            Self {
                marketplace: 0.15,
                curator: 0.05,
                creator: 0.15,
            }
        }
    }

    /// Absolute share amounts in atomic units, floored.
    pub fn amounts(&self, effective_fee: u64) -> ShareAmounts {
        let floor = |fraction: f64| (effective_fee as f64 * fraction).floor() as u64;
        ShareAmounts {
            marketplace: floor(self.marketplace),
            curator: floor(self.curator),
            creator: floor(self.creator),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShareAmounts {
    pub marketplace: u64,
    pub curator: u64,
    pub creator: u64,
}

/// Who is owed each share for one request.
#[derive(Clone, Debug)]
pub struct PaymentParties {
    pub marketplace: String,
    pub curator: String,
    pub creator: String,
}

/// Total fee for a request: per-unit formats multiply the base price by the
/// requested output count, everything else charges the base price once.
pub fn effective_fee(base_fee: u64, format: PayloadFormat, requested_count: u32) -> u64 {
    if format.per_unit() {
        base_fee * u64::from(requested_count.max(1))
    } else {
        base_fee
    }
}

/// Check the request's own embedded transfer: the operator must have been
/// sent its share of the effective fee, addressed to this operator.
pub fn operator_cut_covered(
    node: &TransactionNode,
    operator_address: &str,
    effective_fee: u64,
) -> bool {
    let minimum = (effective_fee as f64 * OPERATOR_SHARE).floor() as u64;
    match parse_transfer(node) {
        Some(transfer) => transfer.target == operator_address && transfer.qty >= minimum,
        None => false,
    }
}

/// A transfer instruction embedded in a payment record's `Input` tag.
#[derive(Debug)]
struct TransferInstruction {
    target: String,
    qty: u64,
}

fn parse_transfer(node: &TransactionNode) -> Option<TransferInstruction> {
    let input: Value = serde_json::from_str(node.tag(tags::INPUT)?).ok()?;
    if input.get("function")?.as_str()? != "transfer" {
        return None;
    }
    let target = input.get("target")?.as_str()?.to_string();
    let qty = match input.get("qty")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some(TransferInstruction { target, qty })
}

/// Check that the user paid the marketplace, curator and creator shares for
/// one request.
///
/// Each share needs its own distinct record with a transfer instruction to
/// that party of at least the floored share amount. Pure read; no side
/// effects on the ledger.
pub async fn verify_payment(
    gateway: &dyn LedgerGateway,
    user_address: &str,
    request_id: &str,
    parties: &PaymentParties,
    split: FeeSplit,
    effective_fee: u64,
) -> Result<bool, WorkerError> {
    let page = gateway
        .search(&query::payment_records(user_address, request_id))
        .await?;

    let transfers: Vec<TransferInstruction> = page
        .edges
        .iter()
        .filter_map(|edge| parse_transfer(&edge.node))
        .collect();

    if transfers.len() < 3 {
        debug!(
            request = request_id,
            records = transfers.len(),
            "fewer than three transfer records"
        );
        return Ok(false);
    }

    let amounts = split.amounts(effective_fee);
    let mut used = vec![false; transfers.len()];
    let mut claim = |target: &str, minimum: u64| -> bool {
        for (i, transfer) in transfers.iter().enumerate() {
            if !used[i] && transfer.target == target && transfer.qty >= minimum {
                used[i] = true;
                return true;
            }
        }
        false
    };

    let paid = claim(&parties.marketplace, amounts.marketplace)
        && claim(&parties.curator, amounts.curator)
        && claim(&parties.creator, amounts.creator);

    if !paid {
        debug!(request = request_id, ?amounts, "fee shares not covered");
    }
    Ok(paid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_and_v2_splits_differ_only_off_marketplace() {
        let v1 = FeeSplit::for_protocol_version("1.0");
        let v2 = FeeSplit::for_protocol_version("2.0");
        assert_eq!(v1.marketplace, v2.marketplace);
        assert!(v2.curator > v1.curator);
        assert!(v2.creator > v1.creator);
    }

    #[test]
    fn share_amounts_floor_to_atomic_units() {
        let amounts = FeeSplit::for_protocol_version("1.0").amounts(100);
        assert_eq!(amounts.marketplace, 15);
        assert_eq!(amounts.curator, 2);
        assert_eq!(amounts.creator, 2);
    }

    #[test]
    fn per_unit_formats_multiply_the_base_fee() {
        assert_eq!(effective_fee(100, PayloadFormat::FormBased, 4), 400);
        assert_eq!(effective_fee(100, PayloadFormat::FormBased, 0), 100);
        assert_eq!(effective_fee(100, PayloadFormat::ChatCompletion, 4), 100);
    }
}
