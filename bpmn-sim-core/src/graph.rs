//! Process Graph Adapter
//!
//! Read-only view of the BPMN topology the engine walks. The engine never
//! owns the diagram; it consumes an [`ElementRegistry`] supplied by the
//! embedder (a modeling toolkit, a parser, a test fixture) and only needs
//! lookup-by-id and filter-by-predicate.
//!
//! [`DiagramRegistry`] and [`DiagramBuilder`] provide the in-memory
//! implementation used by tests and headless embedders.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ─── Element classification ───────────────────────────────────

/// Closed set of element kinds the engine routes on. Tags the engine does
/// not recognize land in `Other` and take default routing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    Task,
    UserTask,
    ManualTask,
    ServiceTask,
    TimerEvent,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    /// Collaboration pool boundary; never holds a token.
    Participant,
    Other(String),
}

impl ElementKind {
    /// Map a `bpmn:`-prefixed type tag onto a kind.
    pub fn from_tag(tag: &str) -> Self {
        match tag.strip_prefix("bpmn:").unwrap_or(tag) {
            "StartEvent" => ElementKind::StartEvent,
            "EndEvent" => ElementKind::EndEvent,
            "Task" => ElementKind::Task,
            "UserTask" => ElementKind::UserTask,
            "ManualTask" => ElementKind::ManualTask,
            "ServiceTask" => ElementKind::ServiceTask,
            "IntermediateCatchEvent" | "TimerEvent" => ElementKind::TimerEvent,
            "ExclusiveGateway" => ElementKind::ExclusiveGateway,
            "ParallelGateway" => ElementKind::ParallelGateway,
            "InclusiveGateway" => ElementKind::InclusiveGateway,
            "EventBasedGateway" => ElementKind::EventBasedGateway,
            "Participant" => ElementKind::Participant,
            other => ElementKind::Other(other.to_string()),
        }
    }

    /// True for the four routed gateway kinds plus unrecognized tags that
    /// still look like gateways (those get a warning and default routing).
    pub fn is_gateway(&self) -> bool {
        match self {
            ElementKind::ExclusiveGateway
            | ElementKind::ParallelGateway
            | ElementKind::InclusiveGateway
            | ElementKind::EventBasedGateway => true,
            ElementKind::Other(tag) => tag.contains("Gateway"),
            _ => false,
        }
    }

    /// Whether a message flow targeting this kind spawns a token there.
    /// Pool boundaries route messages to their contents visually but are
    /// not themselves token-capable.
    pub fn can_hold_token(&self) -> bool {
        !matches!(self, ElementKind::Participant)
    }
}

/// Declared direction of a gateway, when the diagram carries one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayDirection {
    Unspecified,
    Diverging,
    Converging,
    Mixed,
}

// ─── Flows ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowKind {
    Sequence,
    Message,
}

/// A directed edge between two elements. Sequence flows carry tokens;
/// message flows may spawn an independent token at a token-capable target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub kind: FlowKind,
    pub source: String,
    pub target: String,
    /// Textual `${...}` condition, evaluated by the expression module.
    pub condition: Option<String>,
    pub name: Option<String>,
}

// ─── Elements ─────────────────────────────────────────────────

/// One node of the process graph. Shared immutably via `Arc`; the engine
/// never mutates topology.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    pub name: Option<String>,
    pub incoming: Vec<Flow>,
    pub outgoing: Vec<Flow>,
    pub gateway_direction: Option<GatewayDirection>,
    /// Id of the designated fallback flow for exclusive gateways.
    pub default_flow: Option<String>,
}

impl Element {
    pub fn outgoing_sequence(&self) -> impl Iterator<Item = &Flow> {
        self.outgoing.iter().filter(|f| f.kind == FlowKind::Sequence)
    }

    pub fn outgoing_messages(&self) -> impl Iterator<Item = &Flow> {
        self.outgoing.iter().filter(|f| f.kind == FlowKind::Message)
    }

    pub fn incoming_sequence_count(&self) -> usize {
        self.incoming
            .iter()
            .filter(|f| f.kind == FlowKind::Sequence)
            .count()
    }
}

// ─── Registry trait ───────────────────────────────────────────

/// The minimal read-only graph contract the engine consumes.
///
/// `contains` also covers flow ids so marker removal can check whether a
/// traversed flow still exists in the diagram.
pub trait ElementRegistry: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<Element>>;

    fn filter(&self, pred: &dyn Fn(&Element) -> bool) -> Vec<Arc<Element>>;

    fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }
}

// ─── In-memory registry ───────────────────────────────────────

/// HashMap-backed registry over a fixed diagram.
pub struct DiagramRegistry {
    elements: HashMap<String, Arc<Element>>,
    flow_ids: Vec<String>,
}

impl ElementRegistry for DiagramRegistry {
    fn get(&self, id: &str) -> Option<Arc<Element>> {
        self.elements.get(id).cloned()
    }

    fn filter(&self, pred: &dyn Fn(&Element) -> bool) -> Vec<Arc<Element>> {
        let mut hits: Vec<Arc<Element>> = self
            .elements
            .values()
            .filter(|e| pred(e))
            .cloned()
            .collect();
        // HashMap iteration order is arbitrary; keep results deterministic.
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id) || self.flow_ids.iter().any(|f| f == id)
    }
}

// ─── Builder ──────────────────────────────────────────────────

struct ElementDef {
    id: String,
    kind: ElementKind,
    name: Option<String>,
    gateway_direction: Option<GatewayDirection>,
    default_flow: Option<String>,
}

/// Two-phase diagram assembly: declare elements and flows in any order,
/// then `build()` wires incoming/outgoing lists.
#[derive(Default)]
pub struct DiagramBuilder {
    elements: Vec<ElementDef>,
    flows: Vec<Flow>,
}

impl DiagramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(mut self, id: &str, kind: ElementKind) -> Self {
        self.elements.push(ElementDef {
            id: id.to_string(),
            kind,
            name: None,
            gateway_direction: None,
            default_flow: None,
        });
        self
    }

    pub fn named_element(mut self, id: &str, kind: ElementKind, name: &str) -> Self {
        self.elements.push(ElementDef {
            id: id.to_string(),
            kind,
            name: Some(name.to_string()),
            gateway_direction: None,
            default_flow: None,
        });
        self
    }

    pub fn gateway(mut self, id: &str, kind: ElementKind, direction: GatewayDirection) -> Self {
        self.elements.push(ElementDef {
            id: id.to_string(),
            kind,
            name: None,
            gateway_direction: Some(direction),
            default_flow: None,
        });
        self
    }

    /// Mark a previously declared gateway's designated default flow.
    pub fn default_flow(mut self, element_id: &str, flow_id: &str) -> Self {
        if let Some(def) = self.elements.iter_mut().find(|e| e.id == element_id) {
            def.default_flow = Some(flow_id.to_string());
        }
        self
    }

    pub fn flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.flows.push(Flow {
            id: id.to_string(),
            kind: FlowKind::Sequence,
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            name: None,
        });
        self
    }

    pub fn conditional_flow(mut self, id: &str, source: &str, target: &str, cond: &str) -> Self {
        self.flows.push(Flow {
            id: id.to_string(),
            kind: FlowKind::Sequence,
            source: source.to_string(),
            target: target.to_string(),
            condition: Some(cond.to_string()),
            name: None,
        });
        self
    }

    pub fn message_flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.flows.push(Flow {
            id: id.to_string(),
            kind: FlowKind::Message,
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            name: None,
        });
        self
    }

    pub fn build(self) -> DiagramRegistry {
        let flow_ids = self.flows.iter().map(|f| f.id.clone()).collect();
        let mut elements = HashMap::new();
        for def in self.elements {
            let incoming = self
                .flows
                .iter()
                .filter(|f| f.target == def.id)
                .cloned()
                .collect();
            let outgoing = self
                .flows
                .iter()
                .filter(|f| f.source == def.id)
                .cloned()
                .collect();
            elements.insert(
                def.id.clone(),
                Arc::new(Element {
                    id: def.id,
                    kind: def.kind,
                    name: def.name,
                    incoming,
                    outgoing,
                    gateway_direction: def.gateway_direction,
                    default_flow: def.default_flow,
                }),
            );
        }
        DiagramRegistry { elements, flow_ids }
    }
}
