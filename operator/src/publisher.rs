//! Response publication: tag composition, sealing, upload and asset
//! registration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ledger::{ops, tags, LedgerGateway, Tag, TransactionNode, PROTOCOL_NAME};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::registration::Registration;
use crate::sealing;

/// Longest value any free-text tag may carry.
pub const MAX_TAG_VALUE_LEN: usize = 1000;

const DEFAULT_LICENSE: &str = "yRj4a5KMctX_uOmKWCFJIjmY8DeJcusVk6-HzLiM_t8";
const DEFAULT_DERIVATION: &str = "Allowed-With-License-Passthrough";
const DEFAULT_COMMERCIAL_USE: &str = "Allowed";
const ASSET_CONTRACT_SRC: &str = "Of9pi--Gj7hCTawhgxOwbuWnFI1h24TTgO5pw8ENJNQ";
const ASSET_APP_NAME: &str = "SmartWeaveContract";
const ASSET_APP_VERSION: &str = "0.3.0";

/// Tags a requester's custom tags may never override.
static NOT_OVERRIDABLE: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        tags::PROTOCOL_NAME,
        tags::PROTOCOL_VERSION,
        tags::OPERATION_NAME,
        tags::SERVICE_TRANSACTION,
        tags::SERVICE_NAME,
        tags::SERVICE_CURATOR,
        tags::SERVICE_USER,
        tags::SERVICE_OPERATOR,
        tags::REGISTRATION_TRANSACTION,
        tags::REQUEST_TRANSACTION,
        tags::INFERENCE_TRANSACTION,
        tags::SEQUENCER_OWNER,
        tags::CONTRACT,
        tags::INPUT,
        tags::UNIX_TIME,
        tags::CONTENT_TYPE,
        tags::MODEL_NAME,
        tags::MODEL_CREATOR,
        tags::APP_NAME,
        tags::APP_VERSION,
        tags::CONTRACT_SRC,
        tags::INIT_STATE,
    ])
});

fn truncated(value: &str) -> String {
    value.chars().take(MAX_TAG_VALUE_LEN).collect()
}

/// One produced output ready for upload.
pub struct PublishItem {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub seed: Option<String>,
}

/// Everything about the request the tag set echoes back.
pub struct ResponseContext<'a> {
    pub registration: &'a Registration,
    pub request: &'a TransactionNode,
    pub protocol_version: &'a str,
    pub conversation_id: &'a str,
    pub prompt: &'a str,
}

pub struct Publisher {
    gateway: Arc<dyn LedgerGateway>,
    operator_address: String,
    /// Bundler node label passed to asset registration.
    registrar_node: String,
}

impl Publisher {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        operator_address: String,
        registrar_node: String,
    ) -> Self {
        Self {
            gateway,
            operator_address,
            registrar_node,
        }
    }

    /// Upload one response transaction per produced output.
    ///
    /// Upload failures abort the attempt. Asset registration failures are
    /// logged and swallowed; the content is already durably stored.
    pub async fn publish(
        &self,
        ctx: &ResponseContext<'_>,
        items: Vec<PublishItem>,
    ) -> Result<Vec<String>, WorkerError> {
        let sealed_to = self.seal_recipient(ctx.request)?;
        let generate_assets = ctx.request.tag(tags::GENERATE_ASSETS) != Some("none");
        let asset_names = parse_asset_names(ctx.request);

        let mut published = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let (bytes, content_type) = match &sealed_to {
                Some(recipient) => {
                    let sealed = sealing::seal(recipient, &item.bytes)
                        .map_err(|err| WorkerError::malformed(&ctx.request.id, err.to_string()))?;
                    (sealed, "application/octet-stream".to_string())
                }
                None => (item.bytes, item.content_type.clone()),
            };

            let response_tags = self.compose_tags(
                ctx,
                &content_type,
                item.seed.as_deref(),
                asset_name(&asset_names, index),
                generate_assets,
            );

            let receipt = self
                .gateway
                .upload(bytes, response_tags)
                .await
                .map_err(WorkerError::Publish)?;
            info!(
                response = %receipt.id,
                request = %ctx.request.id,
                "response published"
            );

            if generate_assets {
                match self
                    .gateway
                    .register_asset(&receipt.id, &self.registrar_node)
                    .await
                {
                    Ok(contract) => info!(response = %receipt.id, %contract, "asset registered"),
                    Err(err) => {
                        warn!(response = %receipt.id, %err, "asset registration failed")
                    }
                }
            }

            published.push(receipt.id);
        }

        Ok(published)
    }

    fn seal_recipient(&self, request: &TransactionNode) -> Result<Option<Vec<u8>>, WorkerError> {
        if request.tag(tags::PRIVATE_MODE) != Some("true") {
            return Ok(None);
        }
        let encoded = request
            .require_tag(tags::PUBLIC_KEY)
            .map_err(|_| WorkerError::malformed(&request.id, "private mode without public key"))?;
        let key = BASE64
            .decode(encoded)
            .map_err(|err| WorkerError::malformed(&request.id, format!("bad public key: {err}")))?;
        Ok(Some(key))
    }

    fn compose_tags(
        &self,
        ctx: &ResponseContext<'_>,
        content_type: &str,
        seed: Option<&str>,
        asset_name: Option<&str>,
        generate_assets: bool,
    ) -> Vec<Tag> {
        let reg = ctx.registration;
        let request = ctx.request;
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let title = asset_name
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{} response", reg.service_name));

        let mut out = vec![
            Tag::new(tags::PROTOCOL_NAME, PROTOCOL_NAME),
            Tag::new(tags::PROTOCOL_VERSION, ctx.protocol_version),
            Tag::new(tags::OPERATION_NAME, ops::INFERENCE_RESPONSE),
            Tag::new(tags::SERVICE_TRANSACTION, &reg.service_id),
            Tag::new(tags::SERVICE_NAME, &reg.service_name),
            Tag::new(tags::SERVICE_OPERATOR, &self.operator_address),
            Tag::new(tags::SERVICE_USER, &request.owner.address),
            Tag::new(tags::REQUEST_TRANSACTION, &request.id),
            Tag::new(tags::MODEL_NAME, &reg.model_name),
            Tag::new(tags::MODEL_CREATOR, &reg.model_creator),
            Tag::new(tags::CONVERSATION_IDENTIFIER, ctx.conversation_id),
            Tag::new(tags::CONTENT_TYPE, content_type),
            Tag::new(tags::UNIX_TIME, unix_time.to_string()),
            Tag::new(tags::PROMPT, truncated(ctx.prompt)),
        ];

        if let Some(negative) = request.tag(tags::NEGATIVE_PROMPT) {
            out.push(Tag::new(tags::NEGATIVE_PROMPT, truncated(negative)));
        }
        if let Some(seed) = seed {
            out.push(Tag::new(tags::INFERENCE_SEED, seed));
        }

        // Discoverability.
        out.push(Tag::new(tags::TITLE, truncated(&title)));
        out.push(Tag::new(tags::DESCRIPTION, truncated(ctx.prompt)));
        out.push(Tag::new(tags::TYPE, media_kind(content_type)));
        out.push(Tag::new(tags::INDEXED_BY, "ucm"));
        out.push(Tag::new(tags::TOPIC_AI, "ai-generated"));

        out.extend(license_tags(request));

        if generate_assets {
            out.extend(asset_tags(&request.owner.address, &title));
        }

        apply_custom_tags(&mut out, request);
        out
    }
}

fn media_kind(content_type: &str) -> &'static str {
    if content_type.starts_with("image/") {
        "image"
    } else if content_type.starts_with("audio/") {
        "audio"
    } else {
        "text"
    }
}

/// Default license tags, replaced wholesale by a well-formed
/// `License-Config` on the request.
fn license_tags(request: &TransactionNode) -> Vec<Tag> {
    if let Some(config) = request.tag(tags::LICENSE_CONFIG) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(config) {
            let custom: Vec<Tag> = map
                .iter()
                .filter_map(|(name, value)| {
                    value.as_str().map(|v| Tag::new(name, truncated(v)))
                })
                .collect();
            if !custom.is_empty() {
                return custom;
            }
        }
        warn!(request = %request.id, "malformed license config, using defaults");
    }
    vec![
        Tag::new(tags::LICENSE, DEFAULT_LICENSE),
        Tag::new(tags::DERIVATION, DEFAULT_DERIVATION),
        Tag::new(tags::COMMERCIAL_USE, DEFAULT_COMMERCIAL_USE),
    ]
}

/// Atomic-asset bootstrap tags. The requester owns the minted asset.
fn asset_tags(owner: &str, title: &str) -> Vec<Tag> {
    let init_state = json!({
        "firstOwner": owner,
        "canEvolve": false,
        "balances": { owner: 1 },
        "name": title,
        "ticker": "INFOUT",
    });
    vec![
        Tag::new(tags::APP_NAME, ASSET_APP_NAME),
        Tag::new(tags::APP_VERSION, ASSET_APP_VERSION),
        Tag::new(tags::CONTRACT_SRC, ASSET_CONTRACT_SRC),
        Tag::new(tags::INIT_STATE, init_state.to_string()),
    ]
}

fn parse_asset_names(request: &TransactionNode) -> Vec<String> {
    request
        .tag(tags::ASSET_NAMES)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .unwrap_or_default()
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Title for the n-th output. Requests with fewer names than outputs cycle
/// through the list again.
fn asset_name(names: &[String], index: usize) -> Option<&str> {
    if names.is_empty() {
        return None;
    }
    Some(names[index % names.len()].as_str())
}

/// Apply requester custom tags, overriding anything except the
/// protocol-critical set.
fn apply_custom_tags(out: &mut Vec<Tag>, request: &TransactionNode) {
    let Some(raw) = request.tag(tags::USER_CUSTOM_TAGS) else {
        return;
    };
    let Ok(custom) = serde_json::from_str::<Vec<Tag>>(raw) else {
        warn!(request = %request.id, "malformed custom tags ignored");
        return;
    };

    for tag in custom {
        if NOT_OVERRIDABLE.contains(tag.name.as_str()) {
            continue;
        }
        out.retain(|existing| existing.name != tag.name);
        out.push(Tag::new(tag.name, truncated(&tag.value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger::Owner;

    fn request_with_tags(extra: Vec<Tag>) -> TransactionNode {
        TransactionNode {
            id: "req-1".to_string(),
            owner: Owner {
                address: "user-addr".to_string(),
                public_key: None,
            },
            tags: extra,
            block_height: Some(10),
        }
    }

    #[test]
    fn license_config_replaces_defaults_wholesale() {
        let request = request_with_tags(vec![Tag::new(
            tags::LICENSE_CONFIG,
            r#"{"License":"custom-license","Commercial-Use":"Disallowed"}"#,
        )]);
        let out = license_tags(&request);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|t| t.value != DEFAULT_LICENSE || t.name != tags::LICENSE));
        assert!(out.iter().any(|t| t.value == "custom-license"));
    }

    #[test]
    fn malformed_license_config_falls_back_to_defaults() {
        let request = request_with_tags(vec![Tag::new(tags::LICENSE_CONFIG, "not json")]);
        let out = license_tags(&request);
        assert!(out.iter().any(|t| t.name == tags::LICENSE && t.value == DEFAULT_LICENSE));
    }

    #[test]
    fn custom_tags_cannot_touch_protocol_tags() {
        let request = request_with_tags(vec![Tag::new(
            tags::USER_CUSTOM_TAGS,
            r#"[{"name":"Operation-Name","value":"forged"},{"name":"Mood","value":"calm"}]"#,
        )]);
        let mut out = vec![Tag::new(tags::OPERATION_NAME, ops::INFERENCE_RESPONSE)];
        apply_custom_tags(&mut out, &request);

        assert!(out
            .iter()
            .any(|t| t.name == tags::OPERATION_NAME && t.value == ops::INFERENCE_RESPONSE));
        assert!(out.iter().any(|t| t.name == "Mood" && t.value == "calm"));
    }

    #[test]
    fn custom_tag_overrides_replace_earlier_values() {
        let request = request_with_tags(vec![Tag::new(
            tags::USER_CUSTOM_TAGS,
            r#"[{"name":"Title","value":"my title"}]"#,
        )]);
        let mut out = vec![Tag::new(tags::TITLE, "generated title")];
        apply_custom_tags(&mut out, &request);

        let titles: Vec<_> = out.iter().filter(|t| t.name == tags::TITLE).collect();
        assert_eq!(titles.len(), 1);
        assert_eq!(titles[0].value, "my title");
    }

    #[test]
    fn truncation_is_character_safe() {
        let long = "é".repeat(MAX_TAG_VALUE_LEN + 50);
        assert_eq!(truncated(&long).chars().count(), MAX_TAG_VALUE_LEN);
    }

    #[test]
    fn asset_names_cycle_when_outputs_outnumber_them() {
        let request =
            request_with_tags(vec![Tag::new(tags::ASSET_NAMES, r#"[" first ","","second"]"#)]);
        let names = parse_asset_names(&request);
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);

        assert_eq!(asset_name(&names, 0), Some("first"));
        assert_eq!(asset_name(&names, 1), Some("second"));
        assert_eq!(asset_name(&names, 2), Some("first"));
        assert_eq!(asset_name(&names, 5), Some("second"));
        assert_eq!(asset_name(&[], 0), None);
    }
}
