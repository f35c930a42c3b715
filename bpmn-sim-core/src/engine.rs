//! Token Advancement Engine
//!
//! Computes, for one token sitting on one element, its successor tokens,
//! or a pause signal when the element needs an external decision. Routing
//! is driven by [`ElementKind`]; everything unrecognized degrades to the
//! default first-outgoing-flow advance. All failure modes here are
//! fail-soft: a warning and a dropped token, never a halt.

use crate::expr::{evaluate_condition, Context, Value};
use crate::graph::{Element, ElementKind, ElementRegistry, Flow, GatewayDirection};
use crate::joins::common_join_targets;
use crate::token::{Token, TokenId};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Viable flow set published while the engine waits for a decision.
#[derive(Clone, Debug, Serialize)]
pub struct PendingPaths {
    pub gateway_id: String,
    pub gateway_kind: ElementKind,
    pub flows: Vec<Flow>,
}

/// Outcome of advancing a single token.
#[derive(Debug)]
pub enum Advance {
    /// Successor tokens. Empty means the token terminated.
    Moved(Vec<Token>),
    /// Park the token and pause pending an external flow selection.
    Awaiting(PendingPaths),
}

/// One step's worth of routing over a fixed graph and context. Borrows the
/// id counter so sibling tokens produced by splits get fresh ids.
pub struct Engine<'a> {
    registry: &'a dyn ElementRegistry,
    context: &'a Context,
    fallback: Option<&'a Value>,
    next_token_id: &'a mut TokenId,
}

impl<'a> Engine<'a> {
    pub fn new(
        registry: &'a dyn ElementRegistry,
        context: &'a Context,
        fallback: Option<&'a Value>,
        next_token_id: &'a mut TokenId,
    ) -> Self {
        Self {
            registry,
            context,
            fallback,
            next_token_id,
        }
    }

    fn alloc_id(&mut self) -> TokenId {
        let id = *self.next_token_id;
        *self.next_token_id += 1;
        id
    }

    /// Route one token. `selection` carries the flow id(s) chosen at a
    /// paused decision point and is honored without re-evaluation.
    pub fn advance(&mut self, token: &Token, selection: Option<&[String]>) -> Advance {
        let Some(element) = token.element.clone() else {
            // A token without an element (missing start event) cannot move.
            return Advance::Moved(Vec::new());
        };

        let routed = match element.kind {
            ElementKind::ExclusiveGateway => self.exclusive(token, &element, selection),
            ElementKind::ParallelGateway => self.parallel(token, &element),
            ElementKind::InclusiveGateway => self.inclusive(token, &element, selection),
            ElementKind::EventBasedGateway => self.event_based(token, &element, selection),
            ref kind if kind.is_gateway() => {
                warn!(element = %element.id, ?kind, "unknown gateway kind, routing as default");
                self.default_route(token, &element)
            }
            _ => self.default_route(token, &element),
        };

        match routed {
            Advance::Moved(mut tokens) => {
                tokens.extend(self.message_spawns(&element));
                Advance::Moved(tokens)
            }
            awaiting => awaiting,
        }
    }

    // ── Routing per element kind ──

    fn default_route(&mut self, token: &Token, element: &Element) -> Advance {
        match element.outgoing_sequence().next() {
            Some(flow) => self.follow(token, token.id, flow),
            None => Advance::Moved(Vec::new()),
        }
    }

    fn exclusive(
        &mut self,
        token: &Token,
        element: &Element,
        selection: Option<&[String]>,
    ) -> Advance {
        if let Some(chosen) = first_selected(selection) {
            return match element.outgoing_sequence().find(|f| f.id == chosen) {
                Some(flow) => self.follow(token, token.id, flow),
                None => {
                    warn!(element = %element.id, flow = chosen, "selected flow not found");
                    Advance::Moved(Vec::new())
                }
            };
        }

        let viable: Vec<Flow> = element
            .outgoing_sequence()
            .filter(|flow| self.condition_holds(flow))
            .cloned()
            .collect();

        match viable.len() {
            0 => {
                let default = element
                    .default_flow
                    .as_deref()
                    .and_then(|id| element.outgoing_sequence().find(|f| f.id == id));
                match default {
                    Some(flow) => self.follow(token, token.id, flow),
                    None => {
                        warn!(element = %element.id, "no viable flow and no default, dropping token");
                        Advance::Moved(Vec::new())
                    }
                }
            }
            // Exactly one viable path needs no confirmation.
            1 => self.follow(token, token.id, &viable[0]),
            _ => Advance::Awaiting(PendingPaths {
                gateway_id: element.id.clone(),
                gateway_kind: element.kind.clone(),
                flows: viable,
            }),
        }
    }

    fn parallel(&mut self, token: &Token, element: &Element) -> Advance {
        let flows: Vec<Flow> = element.outgoing_sequence().cloned().collect();
        if flows.is_empty() {
            return Advance::Moved(Vec::new());
        }
        let mut out = Vec::with_capacity(flows.len());
        for (idx, flow) in flows.iter().enumerate() {
            let id = if idx == 0 { token.id } else { self.alloc_id() };
            if let Advance::Moved(tokens) = self.follow(token, id, flow) {
                out.extend(tokens);
            }
        }
        Advance::Moved(out)
    }

    fn inclusive(
        &mut self,
        token: &Token,
        element: &Element,
        selection: Option<&[String]>,
    ) -> Advance {
        let flows: Vec<Flow> = element.outgoing_sequence().cloned().collect();
        let direction = element.gateway_direction;
        let splits = flows.len() >= 2
            && match direction {
                Some(GatewayDirection::Diverging) => true,
                None | Some(GatewayDirection::Unspecified) => {
                    element.incoming_sequence_count() <= 1
                }
                _ => false,
            };

        if !splits {
            // Converging (or pass-through) inclusive gateways behave as
            // default once join synchronization has released the group.
            return self.default_route(token, element);
        }

        let chosen: Vec<Flow> = match selection {
            Some(ids) if !ids.is_empty() => ids
                .iter()
                .filter_map(|id| {
                    let hit = flows.iter().find(|f| &f.id == id).cloned();
                    if hit.is_none() {
                        warn!(element = %element.id, flow = %id, "selected flow not found");
                    }
                    hit
                })
                .collect(),
            // An ambiguous split never auto-selects.
            _ => {
                return Advance::Awaiting(PendingPaths {
                    gateway_id: element.id.clone(),
                    gateway_kind: element.kind.clone(),
                    flows,
                });
            }
        };

        if chosen.is_empty() {
            return Advance::Moved(Vec::new());
        }

        let entries: Vec<String> = chosen.iter().map(|f| f.target.clone()).collect();
        let joins = common_join_targets(self.registry, &entries);
        let expected = chosen.len() as u16;
        debug!(element = %element.id, ?joins, expected, "inclusive split");

        let mut out = Vec::with_capacity(chosen.len());
        for (idx, flow) in chosen.iter().enumerate() {
            let id = if idx == 0 { token.id } else { self.alloc_id() };
            if let Advance::Moved(tokens) = self.follow(token, id, flow) {
                for mut t in tokens {
                    for join in &joins {
                        t.pending_joins.insert(join.clone(), expected);
                    }
                    out.push(t);
                }
            }
        }
        Advance::Moved(out)
    }

    fn event_based(
        &mut self,
        token: &Token,
        element: &Element,
        selection: Option<&[String]>,
    ) -> Advance {
        // Models waiting for one of several external triggers; nothing
        // resolves it but an explicit selection.
        if let Some(chosen) = first_selected(selection) {
            return match element.outgoing_sequence().find(|f| f.id == chosen) {
                Some(flow) => self.follow(token, token.id, flow),
                None => {
                    warn!(element = %element.id, flow = chosen, "selected flow not found");
                    Advance::Moved(Vec::new())
                }
            };
        }
        Advance::Awaiting(PendingPaths {
            gateway_id: element.id.clone(),
            gateway_kind: element.kind.clone(),
            flows: element.outgoing_sequence().cloned().collect(),
        })
    }

    // ── Shared pieces ──

    fn follow(&mut self, token: &Token, id: TokenId, flow: &Flow) -> Advance {
        match self.registry.get(&flow.target) {
            Some(target) => Advance::Moved(vec![token.moved_to(id, target, &flow.id)]),
            None => {
                warn!(flow = %flow.id, target = %flow.target, "flow target missing from registry");
                Advance::Moved(Vec::new())
            }
        }
    }

    fn condition_holds(&self, flow: &Flow) -> bool {
        let Some(body) = flow.condition.as_deref() else {
            return true;
        };
        match evaluate_condition(body, self.context, self.fallback) {
            Ok(viable) => viable,
            Err(err) => {
                warn!(flow = %flow.id, %err, "condition evaluation failed, treating as false");
                false
            }
        }
    }

    /// Independent tokens spawned by message flows leaving this element.
    /// Only token-capable process elements receive one; pool boundaries do
    /// not.
    fn message_spawns(&mut self, element: &Element) -> Vec<Token> {
        let mut spawned = Vec::new();
        for flow in element.outgoing_messages() {
            match self.registry.get(&flow.target) {
                Some(target) if target.kind.can_hold_token() => {
                    let id = self.alloc_id();
                    let mut token = Token::at(id, Some(target));
                    token.via = Some(flow.id.clone());
                    spawned.push(token);
                }
                Some(target) => {
                    debug!(flow = %flow.id, target = %target.id, "message target cannot hold a token");
                }
                None => {
                    warn!(flow = %flow.id, target = %flow.target, "message flow target missing");
                }
            }
        }
        spawned
    }
}

fn first_selected<'s>(selection: Option<&'s [String]>) -> Option<&'s str> {
    selection.and_then(|ids| ids.first()).map(String::as_str)
}

// ─── Join synchronization ─────────────────────────────────────

/// True when tokens must synchronize at this element before passing.
pub fn is_join_element(element: &Element) -> bool {
    matches!(
        element.kind,
        ElementKind::ParallelGateway | ElementKind::InclusiveGateway
    ) && element.incoming_sequence_count() > 1
}

/// Branch count a join group must reach before firing: the expectation
/// recorded at the originating split when present, else the static
/// incoming-flow count.
pub fn expected_arrivals(element: &Element, group: &[Token]) -> usize {
    group
        .iter()
        .find_map(|t| t.pending_joins.get(&element.id).copied())
        .map(usize::from)
        .unwrap_or_else(|| element.incoming_sequence_count())
}

/// Merge a fired join group into one token: first member's id survives,
/// `pending_joins` maps union (larger expectation wins), and the fired
/// join's own entry is cleared.
pub fn merge_group(element: &Arc<Element>, group: &[Token]) -> Token {
    let mut merged = Token::at(group[0].id, Some(element.clone()));
    merged.via = group[0].via.clone();
    for member in group {
        for (join, expected) in &member.pending_joins {
            let slot = merged.pending_joins.entry(join.clone()).or_insert(0);
            *slot = (*slot).max(*expected);
        }
    }
    merged.pending_joins.remove(&element.id);
    merged
}
