//! Token and Log Types
//!
//! A token is the unit of execution state: it sits on exactly one element
//! (or none once terminated). Tokens are immutable values: every step
//! replaces them wholesale rather than mutating in place, which keeps the
//! awaiting slot and join grouping easy to reason about.

use crate::graph::Element;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Monotonically assigned token identifier.
pub type TokenId = u64;

/// A unit of process execution state.
#[derive(Clone, Debug)]
pub struct Token {
    pub id: TokenId,
    /// Current position; `None` when the token has terminated.
    pub element: Option<Arc<Element>>,
    /// Flow traversed to arrive here; drives the flow's `active` marker.
    pub via: Option<String>,
    /// Converging gateway id → branches still required before that join may
    /// fire. Recorded at inclusive splits with partial fan-out.
    pub pending_joins: BTreeMap<String, u16>,
}

impl Token {
    /// Fresh token at an element, with no traversal history.
    pub fn at(id: TokenId, element: Option<Arc<Element>>) -> Self {
        Self {
            id,
            element,
            via: None,
            pending_joins: BTreeMap::new(),
        }
    }

    /// Successor token produced by traversing `via` to `element`, carrying
    /// the parent's join bookkeeping forward.
    pub fn moved_to(&self, id: TokenId, element: Arc<Element>, via: &str) -> Self {
        Self {
            id,
            element: Some(element),
            via: Some(via.to_string()),
            pending_joins: self.pending_joins.clone(),
        }
    }

    pub fn element_id(&self) -> Option<&str> {
        self.element.as_deref().map(|e| e.id.as_str())
    }
}

/// One record of the append-only token log. Termination entries carry
/// `element_id: None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub token_id: TokenId,
    pub element_id: Option<String>,
    pub element_name: Option<String>,
    /// Epoch milliseconds, UTC.
    pub timestamp: i64,
}

impl LogEntry {
    pub fn for_token(token: &Token) -> Self {
        Self {
            token_id: token.id,
            element_id: token.element_id().map(str::to_string),
            element_name: token
                .element
                .as_deref()
                .and_then(|e| e.name.clone()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
