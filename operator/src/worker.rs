//! Per-request processing: load, price, verify, infer, publish.
//!
//! Workers share no mutable state. Every effect is an outbound HTTP call
//! through the gateway or backend seams, which is what makes the whole
//! pipeline testable against in-memory fakes.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ledger::{query, tags, LedgerGateway, TransactionNode};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use x25519_dalek::StaticSecret;

use crate::backend::{parse_output, InferenceBackend, InferenceOutput};
use crate::error::WorkerError;
use crate::payment::{self, FeeSplit, PaymentParties};
use crate::publisher::{PublishItem, Publisher, ResponseContext};
use crate::registration::{PayloadFormat, Registration};
use crate::sealing;
use crate::settlement::FeeDistributor;

pub const DEFAULT_OUTPUT_COUNT: u32 = 4;
pub const MAX_OUTPUT_COUNT: u32 = 10;

/// Published instead of failing forever when a document payload yields no
/// extractable text.
const DOCUMENT_APOLOGY: &str =
    "The attached document could not be read. Please resubmit the request \
     with the content as plain text.";

const DOCUMENT_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.oasis.opendocument.text",
    "application/rtf",
];

/// What one worker run accomplished.
#[derive(Clone, Debug)]
pub struct FulfillmentReport {
    pub request_id: String,
    pub service_id: String,
    pub effective_fee: u64,
    pub protocol_version: String,
    pub payment: PaymentChannel,
    pub published: Vec<String>,
    pub outcome: FulfillmentOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    Fulfilled { produced: usize },
    AlreadyFulfilled,
}

/// Where the fee for a request was paid and verified.
///
/// Ledger-paid requests carry their marketplace/curator/creator shares as
/// transfer records; the operator owes nothing further. Settlement-paid
/// requests put the whole fee in the operator's settlement wallet, so the
/// cuts still have to be forwarded after fulfillment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentChannel {
    Ledger,
    Settlement,
}

/// Shared, immutable dependencies of every worker run.
pub struct WorkerContext {
    pub gateway: Arc<dyn LedgerGateway>,
    pub backend: Arc<dyn InferenceBackend>,
    pub publisher: Publisher,
    pub operator_address: String,
    pub marketplace_address: String,
    /// Present when the operator accepts settlement-chain payments.
    pub settlement: Option<Arc<FeeDistributor>>,
    /// Present when the operator advertises private mode.
    pub sealing_secret: Option<StaticSecret>,
}

impl WorkerContext {
    /// Run the full pipeline for one paid request.
    pub async fn process_request(
        &self,
        registration: &Registration,
        request_id: &str,
    ) -> Result<FulfillmentReport, WorkerError> {
        let request = self
            .gateway
            .transaction(request_id)
            .await?
            .ok_or_else(|| WorkerError::RequestVanished(request_id.to_string()))?;

        let protocol_version = request
            .tag(tags::PROTOCOL_VERSION)
            .ok_or_else(|| WorkerError::malformed(request_id, "missing protocol version"))?
            .to_string();
        let conversation_id = request
            .tag(tags::CONVERSATION_IDENTIFIER)
            .ok_or_else(|| WorkerError::malformed(request_id, "missing conversation id"))?
            .to_string();

        let needed = requested_count(&request, registration.payload_format);
        let effective_fee =
            payment::effective_fee(registration.operator_fee, registration.payload_format, needed);
        let settlement_tx = request.tag(tags::SETTLEMENT_TRANSACTION);
        let payment = if settlement_tx.is_some() {
            PaymentChannel::Settlement
        } else {
            PaymentChannel::Ledger
        };

        let answered = self.count_answered(request_id).await?;
        if answered >= needed {
            debug!(request = request_id, answered, needed, "already fulfilled");
            return Ok(FulfillmentReport {
                request_id: request_id.to_string(),
                service_id: registration.service_id.clone(),
                effective_fee,
                protocol_version,
                payment,
                published: Vec::new(),
                outcome: FulfillmentOutcome::AlreadyFulfilled,
            });
        }
        let missing = needed - answered;

        match settlement_tx {
            None => {
                let split = FeeSplit::for_protocol_version(&protocol_version);
                let parties = PaymentParties {
                    marketplace: self.marketplace_address.clone(),
                    curator: registration.curator.clone(),
                    creator: registration.model_creator.clone(),
                };
                let paid = payment::verify_payment(
                    self.gateway.as_ref(),
                    &request.owner.address,
                    request_id,
                    &parties,
                    split,
                    effective_fee,
                )
                .await?;
                if !paid {
                    return Err(WorkerError::PaymentRejected {
                        id: request_id.to_string(),
                        reason: format!("fee shares for {effective_fee} units not covered"),
                    });
                }
            }
            Some(tx_hash) => {
                let distributor = self.settlement.as_ref().ok_or_else(|| {
                    WorkerError::PaymentRejected {
                        id: request_id.to_string(),
                        reason: "settlement-paid request but no settlement chain configured"
                            .to_string(),
                    }
                })?;
                if !distributor.verify(tx_hash, request_id, effective_fee).await? {
                    return Err(WorkerError::PaymentRejected {
                        id: request_id.to_string(),
                        reason: format!(
                            "settlement transfer {tx_hash} does not cover {effective_fee}"
                        ),
                    });
                }
            }
        }

        let payload = self.load_payload(&request).await?;
        let ctx = ResponseContext {
            registration,
            request: &request,
            protocol_version: &protocol_version,
            conversation_id: &conversation_id,
            prompt: &payload.prompt,
        };

        if payload.unreadable_document {
            let published = self
                .publisher
                .publish(
                    &ResponseContext {
                        prompt: DOCUMENT_APOLOGY,
                        ..ctx
                    },
                    vec![PublishItem {
                        bytes: DOCUMENT_APOLOGY.as_bytes().to_vec(),
                        content_type: "text/plain".to_string(),
                        seed: None,
                    }],
                )
                .await?;
            info!(request = request_id, "unreadable document, apology published");
            return Ok(FulfillmentReport {
                request_id: request_id.to_string(),
                service_id: registration.service_id.clone(),
                effective_fee,
                protocol_version,
                payment,
                published,
                outcome: FulfillmentOutcome::Fulfilled { produced: 1 },
            });
        }

        let history = if registration.payload_format.wants_history() {
            self.load_history(&request.owner.address, &conversation_id, request_id)
                .await
        } else {
            Vec::new()
        };

        let mut published = Vec::new();
        let mut produced = 0usize;
        for _ in 0..missing {
            let body = build_payload(
                registration.payload_format,
                &payload.prompt,
                request.tag(tags::NEGATIVE_PROMPT),
                registration.settings.as_ref(),
                &history,
            );
            let response = self
                .backend
                .invoke(&inference_url(registration), body)
                .await?;
            let output = parse_output(&response)?;
            let items = self.materialize(registration, output).await?;
            produced += items.len();
            published.extend(self.publisher.publish(&ctx, items).await?);
        }

        info!(
            request = request_id,
            produced,
            responses = published.len(),
            "request fulfilled"
        );
        Ok(FulfillmentReport {
            request_id: request_id.to_string(),
            service_id: registration.service_id.clone(),
            effective_fee,
            protocol_version,
            payment,
            published,
            outcome: FulfillmentOutcome::Fulfilled { produced },
        })
    }

    async fn count_answered(&self, request_id: &str) -> Result<u32, WorkerError> {
        let page = self
            .gateway
            .search(&query::published_responses(
                &self.operator_address,
                request_id,
            ))
            .await?;
        Ok(page.edges.len() as u32)
    }

    async fn load_payload(&self, request: &TransactionNode) -> Result<RequestPayload, WorkerError> {
        let blob = self.gateway.fetch_data(&request.id).await?;

        let bytes = if request.tag(tags::PRIVATE_MODE) == Some("true") {
            let secret = self.sealing_secret.as_ref().ok_or_else(|| {
                WorkerError::malformed(&request.id, "sealed request but no sealing key configured")
            })?;
            sealing::open(secret, &blob.bytes)
                .map_err(|err| WorkerError::Unseal(err.to_string()))?
        } else {
            blob.bytes
        };

        let content_type = request
            .tag(tags::CONTENT_TYPE)
            .map(|s| s.to_string())
            .or(blob.content_type);

        if content_type
            .as_deref()
            .map(is_document)
            .unwrap_or(false)
        {
            let text = extract_document_text(&bytes);
            if text.trim().is_empty() {
                return Ok(RequestPayload {
                    prompt: String::new(),
                    unreadable_document: true,
                });
            }
            return Ok(RequestPayload {
                prompt: text,
                unreadable_document: false,
            });
        }

        Ok(RequestPayload {
            prompt: String::from_utf8_lossy(&bytes).into_owned(),
            unreadable_document: false,
        })
    }

    /// Prior turns for a conversation, oldest first. Best effort; a failed
    /// lookup degrades to an empty history rather than failing the request.
    async fn load_history(
        &self,
        user_address: &str,
        conversation_id: &str,
        current_request: &str,
    ) -> Vec<Value> {
        let mut turns: Vec<(u64, &'static str, String)> = Vec::new();

        for (q, role) in [
            (
                query::conversation_requests(user_address, conversation_id),
                "user",
            ),
            (
                query::conversation_responses(&self.operator_address, conversation_id),
                "assistant",
            ),
        ] {
            let page = match self.gateway.search(&q).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(conversation = conversation_id, %err, "history lookup failed");
                    continue;
                }
            };
            for edge in page.edges {
                if edge.node.id == current_request {
                    continue;
                }
                let blob = match self.gateway.fetch_data(&edge.node.id).await {
                    Ok(blob) => blob,
                    Err(_) => continue,
                };
                let textual = blob
                    .content_type
                    .as_deref()
                    .map(|ct| ct.starts_with("text"))
                    .unwrap_or(true);
                if !textual {
                    continue;
                }
                turns.push((
                    edge.node.block_height.unwrap_or(u64::MAX),
                    role,
                    blob.text(),
                ));
            }
        }

        turns.sort_by_key(|(height, _, _)| *height);
        turns
            .into_iter()
            .map(|(_, role, content)| json!({ "role": role, "content": content }))
            .collect()
    }

    /// Turn a backend answer into uploadable items.
    async fn materialize(
        &self,
        registration: &Registration,
        output: InferenceOutput,
    ) -> Result<Vec<PublishItem>, WorkerError> {
        match output {
            InferenceOutput::Images(encoded) => {
                let mut items = Vec::with_capacity(encoded.len());
                for image in encoded {
                    let bytes = BASE64
                        .decode(&image)
                        .map_err(|err| WorkerError::Backend(format!("bad image data: {err}")))?;
                    let seed = self.recover_seed(registration, &image).await;
                    items.push(PublishItem {
                        bytes,
                        content_type: "image/png".to_string(),
                        seed,
                    });
                }
                Ok(items)
            }
            InferenceOutput::ImagePaths(paths) => {
                let mut items = Vec::with_capacity(paths.len());
                for path in paths {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .map_err(|err| WorkerError::Backend(format!("unreadable {path}: {err}")))?;
                    items.push(PublishItem {
                        bytes,
                        content_type: "image/png".to_string(),
                        seed: None,
                    });
                }
                Ok(items)
            }
            InferenceOutput::AudioPath(path) => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|err| WorkerError::Backend(format!("unreadable {path}: {err}")))?;
                Ok(vec![PublishItem {
                    bytes,
                    content_type: audio_content_type(&path).to_string(),
                    seed: None,
                }])
            }
            InferenceOutput::Content(text) | InferenceOutput::Answer(text) => {
                Ok(vec![PublishItem {
                    bytes: text.into_bytes(),
                    content_type: "text/plain".to_string(),
                    seed: None,
                }])
            }
        }
    }

    /// Ask a form-based backend's metadata endpoint for the generation seed.
    /// Strictly best effort.
    async fn recover_seed(&self, registration: &Registration, image_b64: &str) -> Option<String> {
        if registration.payload_format != PayloadFormat::FormBased {
            return None;
        }
        let url = metadata_url(registration);
        let body = json!({ "image": format!("data:image/png;base64,{image_b64}") });
        match self.backend.invoke(&url, body).await {
            Ok(value) => value.get("info").and_then(Value::as_str).and_then(parse_seed),
            Err(err) => {
                debug!(%err, "seed recovery failed");
                None
            }
        }
    }
}

struct RequestPayload {
    prompt: String,
    unreadable_document: bool,
}

/// How many outputs a request wants. Per-unit formats honor the count tag
/// within bounds; everything else answers once.
pub fn requested_count(request: &TransactionNode, format: PayloadFormat) -> u32 {
    if !format.per_unit() {
        return 1;
    }
    request
        .tag(tags::OUTPUT_COUNT)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_OUTPUT_COUNT)
        .clamp(1, MAX_OUTPUT_COUNT)
}

fn inference_url(registration: &Registration) -> String {
    let base = registration.backend_url.trim_end_matches('/');
    match registration.payload_format {
        PayloadFormat::FormBased => format!("{base}/sdapi/v1/txt2img"),
        _ => base.to_string(),
    }
}

fn metadata_url(registration: &Registration) -> String {
    let base = registration.backend_url.trim_end_matches('/');
    format!("{base}/sdapi/v1/png-info")
}

fn is_document(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or(content_type).trim();
    DOCUMENT_CONTENT_TYPES.contains(&essence)
}

/// Naive text recovery from binary document formats: keep printable runs of
/// four or more characters.
fn extract_document_text(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut run = String::new();
    for &b in bytes {
        if (0x20..=0x7e).contains(&b) {
            run.push(b as char);
        } else {
            if run.trim().len() >= 4 {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(run.trim());
            }
            run.clear();
        }
    }
    if run.trim().len() >= 4 {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(run.trim());
    }
    out
}

/// Pull the seed out of a web-form metadata string like
/// `"... Steps: 20, Seed: 1234567890, Size: 512x512 ..."`.
fn parse_seed(info: &str) -> Option<String> {
    let start = info.find("Seed: ")? + "Seed: ".len();
    let digits: String = info[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn audio_content_type(path: &str) -> &'static str {
    if path.ends_with(".mp3") {
        "audio/mpeg"
    } else if path.ends_with(".ogg") {
        "audio/ogg"
    } else {
        "audio/wav"
    }
}

/// Build the outbound request body for one backend call.
fn build_payload(
    format: PayloadFormat,
    prompt: &str,
    negative_prompt: Option<&str>,
    settings: Option<&Value>,
    history: &[Value],
) -> Value {
    match format {
        PayloadFormat::FormBased => {
            let mut body = settings_map(settings);
            body.insert("prompt".to_string(), Value::String(prompt.to_string()));
            if let Some(negative) = negative_prompt {
                body.insert(
                    "negative_prompt".to_string(),
                    Value::String(negative.to_string()),
                );
            }
            Value::Object(body)
        }
        PayloadFormat::ChatCompletion | PayloadFormat::Conversational => {
            let mut messages = history.to_vec();
            messages.push(json!({ "role": "user", "content": prompt }));
            let mut body = settings_map(settings);
            body.insert("messages".to_string(), Value::Array(messages));
            Value::Object(body)
        }
        PayloadFormat::GenericJson => match serde_json::from_str::<Value>(prompt) {
            Ok(Value::Object(user_body)) => {
                let mut body = settings_map(settings);
                body.extend(user_body);
                Value::Object(body)
            }
            _ => {
                let mut body = settings_map(settings);
                body.insert("input".to_string(), Value::String(prompt.to_string()));
                Value::Object(body)
            }
        },
        PayloadFormat::RawText => Value::String(prompt.to_string()),
    }
}

fn settings_map(settings: Option<&Value>) -> Map<String, Value> {
    match settings {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}
