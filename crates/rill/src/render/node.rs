use bytes::Bytes;

use super::dependency::Dependency;
use crate::error::RillError;

/// The value graph a Request serializes.
///
/// `Suspense` opens a Boundary: its children stream in once every dependency
/// below them settles, and `fallback` is shown in the meantime. A Suspense
/// without a fallback cannot display an error state, so failures inside it
/// are handed to the nearest enclosing boundary that can.
#[derive(Debug, Clone)]
pub enum Node {
    Text(String),
    Raw(Bytes),
    Element { tag: String, children: Vec<Node> },
    Fragment(Vec<Node>),
    Suspense { fallback: Option<Box<Node>>, children: Box<Node> },
    Async(Dependency),
    Postpone(String),
    Fail(RillError),
}

impl Node {
    pub fn empty() -> Self {
        Self::Fragment(Vec::new())
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn raw(markup: impl Into<Bytes>) -> Self {
        Self::Raw(markup.into())
    }

    pub fn element(tag: impl Into<String>, children: Vec<Node>) -> Self {
        Self::Element { tag: tag.into(), children }
    }

    pub fn fragment(children: Vec<Node>) -> Self {
        Self::Fragment(children)
    }

    pub fn suspense(fallback: Node, children: Node) -> Self {
        Self::Suspense { fallback: Some(Box::new(fallback)), children: Box::new(children) }
    }

    pub fn suspense_without_fallback(children: Node) -> Self {
        Self::Suspense { fallback: None, children: Box::new(children) }
    }

    pub fn deferred(dependency: Dependency) -> Self {
        Self::Async(dependency)
    }

    pub fn postpone(reason: impl Into<String>) -> Self {
        Self::Postpone(reason.into())
    }

    pub fn fail(error: impl Into<RillError>) -> Self {
        Self::Fail(error.into())
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<Node>> for Node {
    fn from(children: Vec<Node>) -> Self {
        Self::Fragment(children)
    }
}

impl From<Dependency> for Node {
    fn from(dependency: Dependency) -> Self {
        Self::Async(dependency)
    }
}
