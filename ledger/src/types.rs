use serde::{Deserialize, Serialize};

use crate::gateway::LedgerError;

/// A name/value pair attached to a ledger transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Transaction author as reported by the ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub address: String,
    /// Base64 public key material, when the ledger exposes it.
    pub public_key: Option<String>,
}

/// A single ledger transaction as returned by the search endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionNode {
    pub id: String,
    pub owner: Owner,
    pub tags: Vec<Tag>,
    pub block_height: Option<u64>,
}

impl TransactionNode {
    /// Look up a tag value by name.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }

    /// Look up a tag value, failing with a named error when absent.
    ///
    /// Required fields are resolved through this once at ingestion so a
    /// malformed transaction surfaces as an error instead of propagating
    /// `None` through the pipeline.
    pub fn require_tag(&self, name: &str) -> Result<&str, LedgerError> {
        self.tag(name)
            .ok_or_else(|| LedgerError::MissingTag(name.to_string()))
    }
}

/// A search result entry with its pagination cursor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub cursor: Option<String>,
    pub node: TransactionNode,
}

/// One page of search results.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Page {
    pub edges: Vec<Edge>,
    pub has_next_page: bool,
}

impl Page {
    pub fn last_cursor(&self) -> Option<String> {
        self.edges.iter().rev().find_map(|e| e.cursor.clone())
    }

    pub fn last_block_height(&self) -> Option<u64> {
        self.edges.iter().rev().find_map(|e| e.node.block_height)
    }
}

/// Match transactions carrying a tag with one of the listed values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagFilter {
    pub name: String,
    pub values: Vec<String>,
}

/// A tag-filtered, owner-filtered, cursor-paginated ledger search.
#[derive(Clone, Debug, Default)]
pub struct TagQuery {
    pub tags: Vec<TagFilter>,
    pub owners: Vec<String>,
    pub first: usize,
    pub after: Option<String>,
}

impl TagQuery {
    pub fn new(first: usize) -> Self {
        Self {
            first,
            ..Self::default()
        }
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(TagFilter {
            name: name.into(),
            values: vec![value.into()],
        });
        self
    }

    pub fn tag_any(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.push(TagFilter {
            name: name.into(),
            values,
        });
        self
    }

    pub fn owner(mut self, address: impl Into<String>) -> Self {
        self.owners.push(address.into());
        self
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.after = cursor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with_tags(tags: Vec<Tag>) -> TransactionNode {
        TransactionNode {
            id: "tx-1".to_string(),
            owner: Owner {
                address: "addr-1".to_string(),
                public_key: None,
            },
            tags,
            block_height: Some(7),
        }
    }

    #[test]
    fn tag_lookup_returns_first_match() {
        let node = node_with_tags(vec![
            Tag::new("Model-Name", "aria"),
            Tag::new("Model-Name", "shadow"),
        ]);
        assert_eq!(node.tag("Model-Name"), Some("aria"));
    }

    #[test]
    fn require_tag_names_the_missing_field() {
        let node = node_with_tags(vec![]);
        let err = node.require_tag("Operator-Fee").unwrap_err();
        assert!(err.to_string().contains("Operator-Fee"));
    }

    #[test]
    fn page_last_cursor_skips_trailing_none() {
        let page = Page {
            edges: vec![
                Edge {
                    cursor: Some("c1".to_string()),
                    node: node_with_tags(vec![]),
                },
                Edge {
                    cursor: None,
                    node: node_with_tags(vec![]),
                },
            ],
            has_next_page: true,
        };
        assert_eq!(page.last_cursor(), Some("c1".to_string()));
    }
}
