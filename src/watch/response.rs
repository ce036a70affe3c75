//! Wire model of the etcd v2 keys API response.

use serde::Deserialize;

/// Actions whose node reports keys being removed rather than set.
const TOMBSTONE_ACTIONS: [&str; 2] = ["delete", "expire"];

/// Top-level v2 response: an action plus a recursive node tree.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchResponse {
    pub action: String,
    pub node: Option<Node>,
}

/// One node of the hierarchical key space.
///
/// Unknown fields (`createdIndex`, `ttl`, ...) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Node {
    /// Absolute key; the store's root node omits it.
    pub key: String,
    pub dir: bool,
    pub value: Option<String>,
    #[serde(rename = "modifiedIndex")]
    pub modified_index: Option<u64>,
    pub nodes: Vec<Node>,
}

impl WatchResponse {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Whether this response's leaves are tombstones.
    pub fn is_tombstone(&self) -> bool {
        TOMBSTONE_ACTIONS.contains(&self.action.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_response() {
        let body = r#"{
            "action": "get",
            "node": {
                "key": "/service",
                "dir": true,
                "modifiedIndex": 10,
                "nodes": [
                    {
                        "key": "/service/search",
                        "dir": true,
                        "nodes": [
                            {"key": "/service/search/a", "value": "1", "modifiedIndex": 11, "createdIndex": 9}
                        ]
                    }
                ]
            }
        }"#;
        let response = WatchResponse::parse(body).unwrap();
        assert_eq!(response.action, "get");
        assert!(!response.is_tombstone());
        let root = response.node.unwrap();
        assert!(root.dir);
        assert_eq!(root.nodes[0].nodes[0].value.as_deref(), Some("1"));
        assert_eq!(root.nodes[0].nodes[0].modified_index, Some(11));
        assert_eq!(root.nodes[0].modified_index, None);
    }

    #[test]
    fn test_tombstone_actions() {
        for action in ["delete", "expire"] {
            let body = format!(r#"{{"action": "{action}", "node": {{"key": "/k", "modifiedIndex": 5}}}}"#);
            assert!(WatchResponse::parse(&body).unwrap().is_tombstone());
        }
        let body = r#"{"action": "set", "node": {"key": "/k", "value": "v"}}"#;
        assert!(!WatchResponse::parse(body).unwrap().is_tombstone());
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        assert!(WatchResponse::parse("etcd is down").is_err());
        assert!(WatchResponse::parse("{\"node\": {}}").is_err());
    }
}
