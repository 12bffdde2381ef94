//! GraphQL-over-HTTP implementation of [`LedgerGateway`].

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::gateway::{DataBlob, LedgerError, LedgerGateway, UploadReceipt};
use crate::types::{Edge, Owner, Page, Tag, TagQuery, TransactionNode};

const HTTP_TIMEOUT_SECS: u64 = 120;

const SEARCH_QUERY: &str = r#"
query FindByTags($tags: [TagFilter!], $owners: [String!], $first: Int!, $after: String) {
  transactions(tags: $tags, owners: $owners, first: $first, after: $after, sort: HEIGHT_DESC) {
    pageInfo { hasNextPage }
    edges {
      cursor
      node {
        id
        tags { name value }
        owner { address key }
        block { height }
      }
    }
  }
}"#;

const BY_ID_QUERY: &str = r#"
query TxById($ids: [ID!]) {
  transactions(ids: $ids, first: 1, sort: HEIGHT_DESC) {
    pageInfo { hasNextPage }
    edges {
      cursor
      node {
        id
        tags { name value }
        owner { address key }
        block { height }
      }
    }
  }
}"#;

/// Gateway endpoints: GraphQL search, raw transaction data, and the bundler
/// node used for uploads and asset registration.
#[derive(Clone, Debug)]
pub struct LedgerEndpoints {
    pub graphql_url: String,
    pub data_url: String,
    pub bundler_url: String,
}

pub struct HttpLedgerGateway {
    client: Client,
    endpoints: LedgerEndpoints,
}

impl HttpLedgerGateway {
    pub fn new(endpoints: LedgerEndpoints) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|err| LedgerError::Http(err.to_string()))?;
        Ok(Self { client, endpoints })
    }

    async fn graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<TransactionsPage, LedgerError> {
        let body = json!({ "query": query, "variables": variables });
        let response = self
            .client
            .post(&self.endpoints.graphql_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LedgerError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::Http(format!(
                "gateway returned {}",
                response.status()
            )));
        }

        let parsed: GraphqlResponse = response
            .json()
            .await
            .map_err(|err| LedgerError::Malformed(err.to_string()))?;

        if let Some(errors) = parsed.errors {
            return Err(LedgerError::Malformed(errors.to_string()));
        }

        parsed
            .data
            .map(|d| d.transactions)
            .ok_or_else(|| LedgerError::Malformed("response missing data".to_string()))
    }
}

#[async_trait]
impl LedgerGateway for HttpLedgerGateway {
    async fn search(&self, query: &TagQuery) -> Result<Page, LedgerError> {
        let owners = if query.owners.is_empty() {
            serde_json::Value::Null
        } else {
            json!(query.owners)
        };
        let variables = json!({
            "tags": query.tags,
            "owners": owners,
            "first": query.first,
            "after": query.after,
        });
        let page = self.graphql(SEARCH_QUERY, variables).await?;
        debug!(edges = page.edges.len(), "ledger search page fetched");
        Ok(page.into())
    }

    async fn transaction(&self, id: &str) -> Result<Option<TransactionNode>, LedgerError> {
        let page = self
            .graphql(BY_ID_QUERY, json!({ "ids": [id] }))
            .await?;
        let page: Page = page.into();
        Ok(page.edges.into_iter().next().map(|e| e.node))
    }

    async fn fetch_data(&self, id: &str) -> Result<DataBlob, LedgerError> {
        let url = format!("{}/{}", self.endpoints.data_url.trim_end_matches('/'), id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| LedgerError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::DataNotFound(id.to_string()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|err| LedgerError::Http(err.to_string()))?;

        Ok(DataBlob {
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    async fn upload(&self, bytes: Vec<u8>, tags: Vec<Tag>) -> Result<UploadReceipt, LedgerError> {
        let url = format!("{}/tx", self.endpoints.bundler_url.trim_end_matches('/'));
        let body = json!({
            "data": BASE64.encode(&bytes),
            "tags": tags,
        });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LedgerError::Upload(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::Upload(format!(
                "bundler returned {}",
                response.status()
            )));
        }

        let receipt: UploadResponse = response
            .json()
            .await
            .map_err(|err| LedgerError::Malformed(err.to_string()))?;
        Ok(UploadReceipt { id: receipt.id })
    }

    async fn register_asset(&self, tx_id: &str, node_id: &str) -> Result<String, LedgerError> {
        let url = format!(
            "{}/register",
            self.endpoints.bundler_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "id": tx_id, "node": node_id }))
            .send()
            .await
            .map_err(|err| LedgerError::AssetRegistration(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::AssetRegistration(format!(
                "registrar returned {}",
                response.status()
            )));
        }

        let parsed: RegisterResponse = response
            .json()
            .await
            .map_err(|err| LedgerError::Malformed(err.to_string()))?;
        Ok(parsed.contract_tx_id)
    }
}

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<TransactionsData>,
    errors: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct TransactionsData {
    transactions: TransactionsPage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionsPage {
    page_info: PageInfo,
    edges: Vec<RawEdge>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
}

#[derive(Deserialize)]
struct RawEdge {
    cursor: Option<String>,
    node: RawNode,
}

#[derive(Deserialize)]
struct RawNode {
    id: String,
    #[serde(default)]
    tags: Vec<Tag>,
    owner: Option<RawOwner>,
    block: Option<RawBlock>,
}

#[derive(Deserialize)]
struct RawOwner {
    address: String,
    key: Option<String>,
}

#[derive(Deserialize)]
struct RawBlock {
    height: Option<u64>,
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    contract_tx_id: String,
}

impl From<TransactionsPage> for Page {
    fn from(page: TransactionsPage) -> Self {
        Page {
            has_next_page: page.page_info.has_next_page,
            edges: page
                .edges
                .into_iter()
                .map(|edge| Edge {
                    cursor: edge.cursor,
                    node: TransactionNode {
                        id: edge.node.id,
                        owner: edge
                            .node
                            .owner
                            .map(|o| Owner {
                                address: o.address,
                                public_key: o.key,
                            })
                            .unwrap_or_default(),
                        tags: edge.node.tags,
                        block_height: edge.node.block.and_then(|b| b.height),
                    },
                })
                .collect(),
        }
    }
}
