//! Routing identifiers.
//!
//! Requests are keyed by a two-level identifier: a conversation and a
//! node within it. Both are opaque strings supplied by the supervisor;
//! equality is exact, no normalization is applied.
//!
//! All nodes of one conversation execute on the same script engine, so
//! they observe shared engine globals. The pairing is captured by
//! [`PairKey`], the key of the compiled-function registry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversation identifier.
///
/// A conversation groups nodes that share script-engine state. The
/// engine assignment for a conversation is made at first compile and
/// is stable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConvId(String);

impl ConvId {
    /// Creates a conversation id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConvId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConvId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Node identifier within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Registry key: one compiled function per `(conversation, node)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    /// Conversation component.
    pub conv: ConvId,
    /// Node component.
    pub node: NodeId,
}

impl PairKey {
    /// Creates a pair key.
    #[must_use]
    pub fn new(conv: impl Into<ConvId>, node: impl Into<NodeId>) -> Self {
        Self {
            conv: conv.into(),
            node: node.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.conv, self.node)
    }
}
