//! bpmn-sim-core: Token-flow simulation for BPMN process diagrams
//!
//! This crate animates a process diagram with live tokens, with NO
//! rendering or modeling dependencies:
//! - Element/flow graph contract and an in-memory registry
//! - Routing engine for tasks, events, and the four gateway kinds
//! - `${...}` condition expression evaluation over a variable context
//! - Join synchronization, including partial inclusive fan-out
//! - Scheduler facade with pause/resume, manual stepping, and explicit
//!   flow selection at ambiguous gateways
//! - Append-only token log with pluggable persistence
//! - Canvas marker diffing for embedders that do render
//!
//! The embedder supplies the diagram (any [`ElementRegistry`]), a
//! [`Canvas`] to decorate, and a [`LogStore`] for the log.

pub mod canvas;
pub mod engine;
pub mod expr;
pub mod graph;
pub mod handlers;
pub mod joins;
pub mod sim;
pub mod store;
pub mod token;

// Re-export the embedder-facing surface
pub use canvas::{Canvas, NullCanvas, RecordingCanvas, ACTIVE_MARKER};
pub use engine::PendingPaths;
pub use expr::{Context, Value};
pub use graph::{
    DiagramBuilder, DiagramRegistry, Element, ElementKind, ElementRegistry, Flow, FlowKind,
    GatewayDirection,
};
pub use handlers::{ElementHandler, HandlerApi, WaitHandler};
pub use sim::{SimHandle, Simulation, SimulationConfig};
pub use store::{LogStore, MemoryStore};
pub use token::{LogEntry, Token, TokenId};
