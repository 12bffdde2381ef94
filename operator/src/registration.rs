//! Registration discovery.
//!
//! A registration is the operator's published commitment to serve one
//! service. Discovery runs once at startup; the resulting set is immutable
//! for the lifetime of the process.

use std::collections::HashMap;

use ledger::{query, tags, LedgerGateway};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BootstrapError, RegistrationError};

/// How a backend wants its requests shaped, and how it answers.
///
/// Closed set on purpose: adding a backend family means adding a variant
/// and its payload builder, not teaching operators a template language.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadFormat {
    /// Web-form style image backend. Charges and answers per output unit.
    FormBased,
    /// OpenAI-style chat completion endpoint answering with `content`.
    ChatCompletion,
    /// Message-history endpoint answering with `answer`.
    Conversational,
    /// Arbitrary JSON-in, JSON-out backend.
    GenericJson,
    /// Plain text prompt forwarded as-is.
    RawText,
}

impl PayloadFormat {
    /// Formats that produce one priced output per requested unit.
    pub fn per_unit(&self) -> bool {
        matches!(self, PayloadFormat::FormBased)
    }

    pub fn wants_history(&self) -> bool {
        matches!(
            self,
            PayloadFormat::ChatCompletion | PayloadFormat::Conversational
        )
    }
}

/// One configured inference backend, keyed in the config by the service
/// declaration's transaction id. Service names are display labels and are
/// not unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendEntry {
    pub url: String,
    pub payload_format: PayloadFormat,
    /// Extra fields merged into every outbound payload.
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

pub type BackendMap = HashMap<String, BackendEntry>;

/// A live subscription: everything the worker needs to price, dispatch and
/// attribute requests for one service.
#[derive(Clone, Debug)]
pub struct Registration {
    /// The registration transaction id.
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub curator: String,
    pub model_name: String,
    pub model_creator: String,
    /// Base price per request (atomic units).
    pub operator_fee: u64,
    pub backend_url: String,
    pub payload_format: PayloadFormat,
    pub settings: Option<serde_json::Value>,
}

/// Find the operator's usable registrations.
///
/// Cancelled registrations, registrations for services without a configured
/// backend, unresolvable service declarations and invalid fees each drop
/// that one registration with a logged reason. An empty surviving set is a
/// bootstrap failure.
pub async fn discover(
    gateway: &dyn LedgerGateway,
    operator_address: &str,
    backends: &BackendMap,
) -> Result<Vec<Registration>, BootstrapError> {
    let mut found = Vec::new();
    let mut seen_services = std::collections::HashSet::new();
    let mut cursor = None;

    loop {
        let page = gateway
            .search(&query::operator_registrations(operator_address).after(cursor))
            .await?;

        for edge in &page.edges {
            let node = &edge.node;
            match resolve_registration(gateway, operator_address, backends, node).await {
                Ok(reg) => {
                    // Height-descending order, so the first sighting of a
                    // service is the newest registration for it.
                    if seen_services.insert(reg.service_id.clone()) {
                        info!(
                            registration = %reg.id,
                            service = %reg.service_name,
                            fee = reg.operator_fee,
                            "registration active"
                        );
                        found.push(reg);
                    }
                }
                Err(reason) => {
                    warn!(registration = %node.id, %reason, "registration skipped");
                }
            }
        }

        if !page.has_next_page {
            break;
        }
        cursor = page.last_cursor();
        if cursor.is_none() {
            break;
        }
    }

    if found.is_empty() {
        return Err(BootstrapError::NoRegistrations(
            operator_address.to_string(),
        ));
    }
    Ok(found)
}

async fn resolve_registration(
    gateway: &dyn LedgerGateway,
    operator_address: &str,
    backends: &BackendMap,
    node: &ledger::TransactionNode,
) -> Result<Registration, RegistrationError> {
    let service_id = node
        .require_tag(tags::SERVICE_TRANSACTION)
        .map_err(|err| RegistrationError::UnresolvedService(node.id.clone(), err))?
        .to_string();
    let service_name = node.tag(tags::SERVICE_NAME).unwrap_or_default().to_string();
    let curator = node
        .tag(tags::SERVICE_CURATOR)
        .unwrap_or_default()
        .to_string();

    let cancellation = gateway
        .search(&query::registration_cancellation(operator_address, &node.id))
        .await
        .map_err(|err| RegistrationError::UnresolvedService(node.id.clone(), err))?;
    if !cancellation.edges.is_empty() {
        return Err(RegistrationError::Cancelled(node.id.clone()));
    }

    let backend = backends
        .get(&service_id)
        .ok_or_else(|| RegistrationError::NoBackend(service_id.clone()))?;

    let fee_tag = node.tag(tags::OPERATOR_FEE);
    let operator_fee = fee_tag
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|fee| *fee > 0)
        .ok_or_else(|| {
            RegistrationError::InvalidFee(node.id.clone(), fee_tag.map(|s| s.to_string()))
        })?;

    let (model_name, model_creator) = resolve_service_model(gateway, &service_id).await?;

    Ok(Registration {
        id: node.id.clone(),
        service_id,
        service_name,
        curator,
        model_name,
        model_creator,
        operator_fee,
        backend_url: backend.url.clone(),
        payload_format: backend.payload_format,
        settings: backend.settings.clone(),
    })
}

async fn resolve_service_model(
    gateway: &dyn LedgerGateway,
    service_id: &str,
) -> Result<(String, String), RegistrationError> {
    let page = gateway
        .search(&query::service_creation(service_id))
        .await
        .map_err(|err| RegistrationError::UnresolvedService(service_id.to_string(), err))?;

    let node = page.edges.first().map(|e| &e.node).ok_or_else(|| {
        RegistrationError::UnresolvedService(
            service_id.to_string(),
            ledger::LedgerError::DataNotFound(service_id.to_string()),
        )
    })?;

    let model_name = node
        .require_tag(tags::MODEL_NAME)
        .map_err(|err| RegistrationError::UnresolvedService(service_id.to_string(), err))?
        .to_string();
    let model_creator = node
        .tag(tags::MODEL_CREATOR)
        .unwrap_or(node.owner.address.as_str())
        .to_string();

    Ok((model_name, model_creator))
}
