//! Canned tag queries for the protocol operations the operator cares about.
//!
//! Every query pins `Protocol-Name` so foreign transactions sharing a tag
//! name never leak into the result set.

use crate::types::TagQuery;
use crate::{ops, tags, PROTOCOL_NAME};

/// Protocol versions this operator understands.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1.0", "2.0"];

/// Default page size for polling queries.
pub const PAGE_SIZE: usize = 100;

fn protocol_scoped(first: usize) -> TagQuery {
    TagQuery::new(first)
        .tag(tags::PROTOCOL_NAME, PROTOCOL_NAME)
        .tag_any(
            tags::PROTOCOL_VERSION,
            SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        )
}

/// Registrations published by the operator itself.
pub fn operator_registrations(operator_address: &str) -> TagQuery {
    protocol_scoped(PAGE_SIZE)
        .tag(tags::OPERATION_NAME, ops::OPERATOR_REGISTRATION)
        .owner(operator_address)
}

/// Cancellation markers the operator published against one registration.
pub fn registration_cancellation(operator_address: &str, registration_id: &str) -> TagQuery {
    protocol_scoped(1)
        .tag(tags::OPERATION_NAME, ops::OPERATOR_CANCELLATION)
        .tag(tags::REGISTRATION_TRANSACTION, registration_id)
        .owner(operator_address)
}

/// The service definition a registration points at.
pub fn service_creation(service_id: &str) -> TagQuery {
    protocol_scoped(1)
        .tag(tags::OPERATION_NAME, ops::SERVICE_CREATION)
        .tag(tags::SERVICE_TRANSACTION, service_id)
}

/// Paid inference requests addressed to this operator, across all the
/// services it currently serves.
pub fn inbound_requests(
    operator_address: &str,
    service_ids: Vec<String>,
    after: Option<String>,
) -> TagQuery {
    protocol_scoped(PAGE_SIZE)
        .tag(tags::OPERATION_NAME, ops::INFERENCE_PAYMENT)
        .tag(tags::SERVICE_OPERATOR, operator_address)
        .tag_any(tags::SERVICE_TRANSACTION, service_ids)
        .after(after)
}

/// Fee transfer records a user published for one request.
pub fn payment_records(user_address: &str, request_id: &str) -> TagQuery {
    protocol_scoped(PAGE_SIZE)
        .tag(tags::REQUEST_TRANSACTION, request_id)
        .owner(user_address)
}

/// Responses this operator already published for one request.
pub fn published_responses(operator_address: &str, request_id: &str) -> TagQuery {
    protocol_scoped(PAGE_SIZE)
        .tag(tags::OPERATION_NAME, ops::INFERENCE_RESPONSE)
        .tag(tags::REQUEST_TRANSACTION, request_id)
        .owner(operator_address)
}

/// Prior requests in a conversation, oldest pruned by page size.
pub fn conversation_requests(user_address: &str, conversation_id: &str) -> TagQuery {
    protocol_scoped(PAGE_SIZE)
        .tag(tags::OPERATION_NAME, ops::INFERENCE_PAYMENT)
        .tag(tags::CONVERSATION_IDENTIFIER, conversation_id)
        .owner(user_address)
}

/// Prior responses in a conversation.
pub fn conversation_responses(operator_address: &str, conversation_id: &str) -> TagQuery {
    protocol_scoped(PAGE_SIZE)
        .tag(tags::OPERATION_NAME, ops::INFERENCE_RESPONSE)
        .tag(tags::CONVERSATION_IDENTIFIER, conversation_id)
        .owner(operator_address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_query_pins_the_protocol_name() {
        let queries = [
            operator_registrations("op"),
            registration_cancellation("op", "reg"),
            service_creation("svc"),
            inbound_requests("op", vec!["svc".to_string()], None),
            payment_records("user", "req"),
            published_responses("op", "req"),
        ];
        for query in queries {
            assert!(query
                .tags
                .iter()
                .any(|f| f.name == tags::PROTOCOL_NAME && f.values == vec![PROTOCOL_NAME]));
        }
    }

    #[test]
    fn inbound_requests_carry_cursor_and_services() {
        let query = inbound_requests(
            "op",
            vec!["svc-a".to_string(), "svc-b".to_string()],
            Some("cursor-9".to_string()),
        );
        assert_eq!(query.after.as_deref(), Some("cursor-9"));
        let services = query
            .tags
            .iter()
            .find(|f| f.name == tags::SERVICE_TRANSACTION)
            .unwrap();
        assert_eq!(services.values.len(), 2);
    }
}
