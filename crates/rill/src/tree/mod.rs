//! Declarative render trees loaded from JSON or TOML, used by the `rill`
//! binary and handy for fixtures.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::RillError;
use crate::render::{Dependency, Node};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeDef {
    Text {
        value: String,
    },
    Raw {
        html: String,
    },
    Element {
        tag: String,
        #[serde(default)]
        children: Vec<TreeDef>,
    },
    Fragment {
        #[serde(default)]
        children: Vec<TreeDef>,
    },
    Suspense {
        #[serde(default)]
        fallback: Option<Box<TreeDef>>,
        children: Box<TreeDef>,
    },
    /// Settles with `then` after `ms` milliseconds.
    Delay {
        ms: u64,
        then: Box<TreeDef>,
    },
    Fail {
        message: String,
    },
    Postpone {
        reason: String,
    },
}

impl TreeDef {
    pub fn from_json(json: &str) -> Result<Self, RillError> {
        serde_json::from_str(json)
            .map_err(|e| RillError::deserialization(format!("Failed to parse tree JSON: {e}")))
    }

    pub fn from_toml(source: &str) -> Result<Self, RillError> {
        toml::from_str(source)
            .map_err(|e| RillError::deserialization(format!("Failed to parse tree TOML: {e}")))
    }

    /// Reads a tree file; `.toml` files are parsed as TOML, anything else
    /// as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RillError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RillError::io(format!("Failed to read tree file {}: {e}", path.display()))
        })?;

        match path.extension().and_then(|extension| extension.to_str()) {
            Some("toml") => Self::from_toml(&contents),
            _ => Self::from_json(&contents),
        }
    }

    /// Builds the render graph. `Delay` nodes start their timers here, so
    /// this must run inside a tokio runtime when the tree contains any.
    pub fn into_node(self) -> Node {
        match self {
            Self::Text { value } => Node::text(value),
            Self::Raw { html } => Node::raw(html),
            Self::Element { tag, children } => {
                Node::element(tag, children.into_iter().map(Self::into_node).collect())
            }
            Self::Fragment { children } => {
                Node::fragment(children.into_iter().map(Self::into_node).collect())
            }
            Self::Suspense { fallback, children } => Node::Suspense {
                fallback: fallback.map(|fallback| Box::new(fallback.into_node())),
                children: Box::new(children.into_node()),
            },
            Self::Delay { ms, then } => {
                let then = then.into_node();
                Node::deferred(Dependency::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(then)
                }))
            }
            Self::Fail { message } => Node::Fail(RillError::render(message)),
            Self::Postpone { reason } => Node::postpone(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{RenderOptions, Request};
    use crate::streaming::{MemoryDestination, render_to_stream};
    use crate::wire_format::apply_patches;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PAGE: &str = r#"{
        "type": "element",
        "tag": "main",
        "children": [
            { "type": "text", "value": "Hi" },
            {
                "type": "suspense",
                "fallback": { "type": "text", "value": "..." },
                "children": { "type": "delay", "ms": 5, "then": { "type": "text", "value": "late" } }
            }
        ]
    }"#;

    #[test]
    fn test_parse_json_tree() {
        let tree = TreeDef::from_json(PAGE).expect("parse");
        let TreeDef::Element { tag, children } = tree else {
            panic!("expected element");
        };
        assert_eq!(tag, "main");
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_parse_toml_tree() {
        let source = r#"
            type = "suspense"

            [fallback]
            type = "text"
            value = "loading"

            [children]
            type = "postpone"
            reason = "needs cookies"
        "#;

        let tree = TreeDef::from_toml(source).expect("parse");
        assert_eq!(
            tree,
            TreeDef::Suspense {
                fallback: Some(Box::new(TreeDef::Text { value: "loading".to_string() })),
                children: Box::new(TreeDef::Postpone { reason: "needs cookies".to_string() }),
            }
        );
    }

    #[test]
    fn test_unknown_node_type_is_rejected() {
        let error = TreeDef::from_json(r#"{ "type": "portal" }"#).expect_err("unknown type");
        assert_eq!(error.code(), "DESERIALIZATION_ERROR");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::with_suffix(".json").expect("temp file");
        file.write_all(br#"{ "type": "element", "tag": "p", "children": [{ "type": "text", "value": "a < b" }] }"#)
            .expect("write");

        let node = TreeDef::load(file.path()).expect("load").into_node();
        let mut request = Request::new(node, RenderOptions::default());
        let (destination, probe) = MemoryDestination::new();
        request.start_flowing(Box::new(destination)).expect("attach");
        request.run_until_idle();

        assert_eq!(probe.text(), "<p>a &lt; b</p>");
    }

    #[tokio::test]
    async fn test_delayed_tree_streams_to_completion() {
        let node = TreeDef::from_json(PAGE).expect("parse").into_node();
        let stream = render_to_stream(node, RenderOptions::default()).await.expect("stream");
        let document = stream.collect_text().await.expect("text");

        assert_eq!(
            apply_patches(&document).expect("patch"),
            "<main>Hi<!--$-->late<!--/$--></main>"
        );
    }
}
