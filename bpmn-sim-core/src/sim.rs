//! Simulation Facade and Scheduler
//!
//! Owns the live token set, the append-only log, the awaiting-decision
//! slot, and the timer that paces automatic stepping. All mutation funnels
//! through one async mutex; observers watch cheap snapshot channels for
//! tokens, log, and pending paths.
//!
//! Stepping is wholesale: each pass routes every live token exactly once,
//! grouping tokens that must synchronize at a join. A pass that hits an
//! ambiguous gateway parks the token in the awaiting slot and suspends the
//! scheduler until a flow selection arrives via [`Simulation::step_with`].

use crate::canvas::{Canvas, MarkerSync, NullCanvas};
use crate::engine::{
    expected_arrivals, is_join_element, merge_group, Advance, Engine, PendingPaths,
};
use crate::expr::{Context, Value};
use crate::graph::{ElementKind, ElementRegistry};
use crate::handlers::{ElementHandler, HandlerApi, HandlerRegistry};
use crate::store::{self, LogStore, MemoryStore};
use crate::token::{LogEntry, Token, TokenId};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Tunables for one simulation instance.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// Pause between automatic steps.
    pub delay: Duration,
    /// How long the built-in wait handler holds a token; defaults to
    /// `delay` when unset.
    pub wait_delay: Option<Duration>,
    /// Substituted for variables missing from the context during condition
    /// evaluation. `None` keeps them undefined.
    pub condition_fallback: Option<Value>,
    /// Key the token log persists under.
    pub storage_key: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            wait_delay: None,
            condition_fallback: None,
            storage_key: "bpmn-sim.token-log".to_string(),
        }
    }
}

struct SimState {
    tokens: Vec<Token>,
    /// Token parked at an ambiguous gateway, if any.
    awaiting: Option<Token>,
    /// Whether the scheduler should restart once the awaiting decision
    /// resolves. Captures `running` at the moment of the pause.
    resume_after_choice: bool,
    running: bool,
    next_token_id: TokenId,
    /// Tokens whose element handler is bypassed on their next visit.
    skip_handler: HashSet<TokenId>,
    log: Vec<LogEntry>,
    context: Context,
    timer: Option<AbortHandle>,
    cleanups: Vec<AbortHandle>,
    markers: MarkerSync,
}

struct Inner {
    registry: Arc<dyn ElementRegistry>,
    canvas: Arc<dyn Canvas>,
    store: Arc<dyn LogStore>,
    config: SimulationConfig,
    handlers: RwLock<HandlerRegistry>,
    state: Mutex<SimState>,
    tokens_tx: watch::Sender<Vec<Token>>,
    log_tx: watch::Sender<Vec<LogEntry>>,
    paths_tx: watch::Sender<Option<PendingPaths>>,
    // Keep one receiver per channel alive so `send` stores the value even
    // when no external subscriber exists (`watch::Sender::send` is a no-op
    // otherwise, which would desync the `current_*` snapshots).
    _tokens_rx: watch::Receiver<Vec<Token>>,
    _log_rx: watch::Receiver<Vec<LogEntry>>,
    _paths_rx: watch::Receiver<Option<PendingPaths>>,
}

/// Cloneable facade over one running simulation.
#[derive(Clone)]
pub struct Simulation {
    inner: Arc<Inner>,
}

/// Outcome of routing one token through handlers and the engine.
enum Routed {
    Tokens { tokens: Vec<Token>, pause: bool },
    Awaiting(PendingPaths),
}

/// Element ids and traversed flow ids the canvas should highlight.
fn marker_ids(tokens: &[Token]) -> HashSet<String> {
    let mut ids = HashSet::new();
    for token in tokens {
        if let Some(element) = token.element_id() {
            ids.insert(element.to_string());
        }
        if let Some(via) = &token.via {
            ids.insert(via.clone());
        }
    }
    ids
}

impl Simulation {
    pub fn new(
        registry: Arc<dyn ElementRegistry>,
        canvas: Arc<dyn Canvas>,
        store: Arc<dyn LogStore>,
        config: SimulationConfig,
    ) -> Self {
        let log = store::load_log(&*store, &config.storage_key);

        // A persisted log revives one token at its last known element, so a
        // reloaded session can resume where it left off.
        let mut tokens = Vec::new();
        let mut next_token_id: TokenId = 1;
        if let Some(last) = log.last() {
            next_token_id = log.iter().map(|e| e.token_id).max().unwrap_or(0) + 1;
            if let Some(element_id) = last.element_id.as_deref() {
                match registry.get(element_id) {
                    Some(element) => {
                        info!(token = last.token_id, element = element_id, "restored token from log");
                        tokens.push(Token::at(last.token_id, Some(element)));
                    }
                    None => {
                        debug!(element = element_id, "logged element no longer in diagram");
                    }
                }
            }
        }

        let wait_delay = config.wait_delay.unwrap_or(config.delay);
        let mut markers = MarkerSync::default();
        markers.update(&*registry, &*canvas, marker_ids(&tokens));

        let (tokens_tx, _tokens_rx) = watch::channel(tokens.clone());
        let (log_tx, _log_rx) = watch::channel(log.clone());
        let (paths_tx, _paths_rx) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                registry,
                canvas,
                store,
                config,
                handlers: RwLock::new(HandlerRegistry::with_builtin_waits(wait_delay)),
                state: Mutex::new(SimState {
                    tokens,
                    awaiting: None,
                    resume_after_choice: false,
                    running: false,
                    next_token_id,
                    skip_handler: HashSet::new(),
                    log,
                    context: Context::new(),
                    timer: None,
                    cleanups: Vec::new(),
                    markers,
                }),
                tokens_tx,
                log_tx,
                paths_tx,
                _tokens_rx,
                _log_rx,
                _paths_rx,
            }),
        }
    }

    /// Simulation with no canvas and an in-memory store.
    pub fn headless(registry: Arc<dyn ElementRegistry>, config: SimulationConfig) -> Self {
        Self::new(
            registry,
            Arc::new(NullCanvas),
            Arc::new(MemoryStore::new()),
            config,
        )
    }

    // ─── Observables ──────────────────────────────────────────

    pub fn tokens(&self) -> watch::Receiver<Vec<Token>> {
        self.inner.tokens_tx.subscribe()
    }

    pub fn token_log(&self) -> watch::Receiver<Vec<LogEntry>> {
        self.inner.log_tx.subscribe()
    }

    pub fn pending_paths(&self) -> watch::Receiver<Option<PendingPaths>> {
        self.inner.paths_tx.subscribe()
    }

    pub fn current_tokens(&self) -> Vec<Token> {
        self.inner.tokens_tx.borrow().clone()
    }

    pub fn current_log(&self) -> Vec<LogEntry> {
        self.inner.log_tx.borrow().clone()
    }

    pub fn current_paths(&self) -> Option<PendingPaths> {
        self.inner.paths_tx.borrow().clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    // ─── Control surface ──────────────────────────────────────

    /// Begin (or restart) automatic stepping. Leftover tokens from a
    /// paused or finished run are cleared first; a fresh token is spawned
    /// at the start event.
    pub async fn start(&self) {
        let mut guard = self.inner.state.lock().await;
        let s = &mut *guard;
        if !s.tokens.is_empty() && !s.running {
            self.clear_run_state(s);
        }
        if s.tokens.is_empty() && s.awaiting.is_none() {
            self.spawn_start_token(s);
        }
        s.running = true;
        info!("simulation running");
        self.schedule(s);
    }

    /// Suspend automatic stepping, keeping tokens in place. With no live
    /// tokens this also cancels outstanding handler timers.
    pub async fn pause(&self) {
        let mut guard = self.inner.state.lock().await;
        let s = &mut *guard;
        s.running = false;
        if let Some(timer) = s.timer.take() {
            timer.abort();
        }
        if s.tokens.is_empty() {
            for cleanup in s.cleanups.drain(..) {
                cleanup.abort();
            }
            s.skip_handler.clear();
            s.markers
                .clear(&*self.inner.registry, &*self.inner.canvas);
        }
        debug!("simulation paused");
    }

    /// Restart automatic stepping from the current token positions.
    pub async fn resume(&self) {
        let mut guard = self.inner.state.lock().await;
        let s = &mut *guard;
        s.running = true;
        self.schedule(s);
    }

    /// Halt and discard all run state. The log is kept.
    pub async fn stop(&self) {
        let mut guard = self.inner.state.lock().await;
        self.clear_run_state(&mut guard);
        info!("simulation stopped");
    }

    /// Stop, wipe the log (in memory and persisted), and spawn a fresh
    /// token at the start event. Does not restart the scheduler.
    pub async fn reset(&self) {
        let mut guard = self.inner.state.lock().await;
        let s = &mut *guard;
        self.clear_run_state(s);
        s.log.clear();
        let _ = self.inner.log_tx.send(Vec::new());
        store::clear_log(&*self.inner.store, &self.inner.config.storage_key);
        self.spawn_start_token(s);
        info!("simulation reset");
    }

    /// Wipe the token log without touching live tokens.
    pub async fn clear_token_log(&self) {
        let mut guard = self.inner.state.lock().await;
        guard.log.clear();
        let _ = self.inner.log_tx.send(Vec::new());
        store::clear_log(&*self.inner.store, &self.inner.config.storage_key);
    }

    /// Replace the variable context used for condition evaluation.
    pub async fn set_context(&self, context: Context) {
        self.inner.state.lock().await.context = context;
    }

    /// Install or replace the handler for an element kind.
    pub fn register_handler(&self, kind: ElementKind, handler: Arc<dyn ElementHandler>) {
        self.inner
            .handlers
            .write()
            .expect("handler registry poisoned")
            .register(kind, handler);
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle { sim: self.clone() }
    }

    // ─── Stepping ─────────────────────────────────────────────

    /// Advance every live token one element.
    pub async fn step(&self) {
        self.advance(None).await;
    }

    /// Advance with an explicit flow selection for the awaiting token.
    pub async fn step_with(&self, flow_ids: &[String]) {
        self.advance(Some(flow_ids.to_vec())).await;
    }

    async fn advance(&self, selection: Option<Vec<String>>) {
        let mut guard = self.inner.state.lock().await;
        let s = &mut *guard;
        if let Some(timer) = s.timer.take() {
            timer.abort();
        }

        if let Some(awaiting) = s.awaiting.clone() {
            self.advance_awaiting(s, &awaiting, selection.as_deref()).await;
            return;
        }
        if s.tokens.is_empty() {
            return;
        }
        self.advance_all(s).await;
    }

    async fn advance_awaiting(
        &self,
        s: &mut SimState,
        awaiting: &Token,
        selection: Option<&[String]>,
    ) {
        match self.route(s, awaiting, selection).await {
            Routed::Awaiting(paths) => {
                // Still undecided; keep the token parked.
                let _ = self.inner.paths_tx.send(Some(paths));
            }
            Routed::Tokens { tokens, pause } => {
                self.log_transition(s, awaiting, &tokens);
                s.tokens.retain(|t| t.id != awaiting.id);
                s.tokens.extend(tokens);
                s.awaiting = None;
                let _ = self.inner.paths_tx.send(None);
                self.publish_tokens(s);

                if s.tokens.is_empty() {
                    info!("all tokens consumed, simulation finished");
                    self.finish(s);
                    return;
                }
                if s.resume_after_choice {
                    s.resume_after_choice = false;
                    s.running = true;
                }
                if pause {
                    s.running = false;
                }
                self.schedule(s);
            }
        }
    }

    async fn advance_all(&self, s: &mut SimState) {
        let current = s.tokens.clone();
        let mut next: Vec<Token> = Vec::new();
        let mut processed: HashSet<TokenId> = HashSet::new();
        let mut pause_after = false;

        for token in &current {
            if processed.contains(&token.id) {
                continue;
            }

            // Tokens on a join element route as one group, and only once
            // every expected branch has arrived.
            let subject = match token.element.as_ref() {
                Some(element) if is_join_element(element) => {
                    let group: Vec<Token> = current
                        .iter()
                        .filter(|t| t.element_id() == token.element_id())
                        .cloned()
                        .collect();
                    processed.extend(group.iter().map(|t| t.id));
                    if group.len() < expected_arrivals(element, &group) {
                        next.extend(group);
                        continue;
                    }
                    debug!(element = %element.id, arrived = group.len(), "join fired");
                    merge_group(element, &group)
                }
                _ => {
                    processed.insert(token.id);
                    token.clone()
                }
            };

            match self.route(s, &subject, None).await {
                Routed::Awaiting(paths) => {
                    // Park the subject; tokens not yet routed this pass
                    // stay where they are.
                    next.push(subject.clone());
                    next.extend(
                        current
                            .iter()
                            .filter(|t| !processed.contains(&t.id))
                            .cloned(),
                    );
                    s.tokens = next;
                    s.awaiting = Some(subject);
                    s.resume_after_choice = s.running;
                    s.running = false;
                    let _ = self.inner.paths_tx.send(Some(paths));
                    self.publish_tokens(s);
                    debug!("awaiting path selection");
                    return;
                }
                Routed::Tokens { tokens, pause } => {
                    self.log_transition(s, &subject, &tokens);
                    next.extend(tokens);
                    pause_after |= pause;
                }
            }
        }

        s.tokens = next;
        let _ = self.inner.paths_tx.send(None);
        self.publish_tokens(s);

        if s.tokens.is_empty() {
            info!("all tokens consumed, simulation finished");
            self.finish(s);
            return;
        }
        if pause_after {
            s.running = false;
        }
        self.schedule(s);
    }

    /// Route one token: handler interception first, engine routing second.
    async fn route(&self, s: &mut SimState, token: &Token, selection: Option<&[String]>) -> Routed {
        if let Some(element) = &token.element {
            if s.skip_handler.remove(&token.id) {
                debug!(token = token.id, "handler bypassed once");
            } else {
                let handler = self
                    .inner
                    .handlers
                    .read()
                    .expect("handler registry poisoned")
                    .get(&element.kind);
                if let Some(handler) = handler {
                    let api = HandlerApi::new(self.handle());
                    let intercepted = handler.on_enter(token, &api).await;
                    let (pause, cleanups) = api.into_effects();
                    // Timers that already fired (or were aborted) are done;
                    // keeping them would grow the list for the whole run.
                    s.cleanups.retain(|handle| !handle.is_finished());
                    s.cleanups.extend(cleanups);
                    if let Some(tokens) = intercepted {
                        return Routed::Tokens { tokens, pause };
                    }
                }
            }
        }

        let fallback = self.inner.config.condition_fallback.as_ref();
        let mut engine = Engine::new(
            &*self.inner.registry,
            &s.context,
            fallback,
            &mut s.next_token_id,
        );
        match engine.advance(token, selection) {
            Advance::Moved(tokens) => Routed::Tokens {
                tokens,
                pause: false,
            },
            Advance::Awaiting(paths) => Routed::Awaiting(paths),
        }
    }

    // ─── Internals ────────────────────────────────────────────

    fn spawn_start_token(&self, s: &mut SimState) {
        let start = self
            .inner
            .registry
            .filter(&|e| e.kind == ElementKind::StartEvent)
            .into_iter()
            .next();
        if start.is_none() {
            // A token without an element terminates on its first step.
            warn!("diagram has no start event");
        }
        let id = s.next_token_id;
        s.next_token_id += 1;
        let token = Token::at(id, start);
        self.append_log(s, LogEntry::for_token(&token));
        s.tokens.push(token);
        self.publish_tokens(s);
    }

    /// Log every successor that represents movement, plus a termination
    /// entry when the origin token did not survive.
    fn log_transition(&self, s: &mut SimState, origin: &Token, successors: &[Token]) {
        for successor in successors {
            if successor.id != origin.id || successor.element_id() != origin.element_id() {
                self.append_log(s, LogEntry::for_token(successor));
            }
        }
        if !successors.iter().any(|t| t.id == origin.id) {
            debug!(token = origin.id, "token consumed");
            self.append_log(s, LogEntry::for_token(&Token::at(origin.id, None)));
        }
    }

    fn append_log(&self, s: &mut SimState, entry: LogEntry) {
        s.log.push(entry);
        let _ = self.inner.log_tx.send(s.log.clone());
        store::save_log(&*self.inner.store, &self.inner.config.storage_key, &s.log);
    }

    fn publish_tokens(&self, s: &mut SimState) {
        let _ = self.inner.tokens_tx.send(s.tokens.clone());
        let ids = marker_ids(&s.tokens);
        s.markers
            .update(&*self.inner.registry, &*self.inner.canvas, ids);
    }

    /// Discard tokens, timers, handler state, and the awaiting slot.
    fn clear_run_state(&self, s: &mut SimState) {
        s.running = false;
        if let Some(timer) = s.timer.take() {
            timer.abort();
        }
        for cleanup in s.cleanups.drain(..) {
            cleanup.abort();
        }
        s.skip_handler.clear();
        s.awaiting = None;
        s.resume_after_choice = false;
        s.tokens.clear();
        let _ = self.inner.paths_tx.send(None);
        self.publish_tokens(s);
    }

    fn finish(&self, s: &mut SimState) {
        s.running = false;
        if let Some(timer) = s.timer.take() {
            timer.abort();
        }
        for cleanup in s.cleanups.drain(..) {
            cleanup.abort();
        }
        s.skip_handler.clear();
    }

    /// Arm (or re-arm) the step timer. No-op while not running.
    fn schedule(&self, s: &mut SimState) {
        if let Some(timer) = s.timer.take() {
            timer.abort();
        }
        if !s.running {
            return;
        }
        let sim = self.clone();
        let delay = self.inner.config.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sim.step().await;
        });
        s.timer = Some(task.abort_handle());
    }
}

/// Handle for resuming a simulation from outside a step, typically from a
/// handler's timer task.
#[derive(Clone)]
pub struct SimHandle {
    sim: Simulation,
}

impl SimHandle {
    pub async fn resume(&self) {
        self.sim.resume().await;
    }

    /// Resume, bypassing the element handler for `token` on its next
    /// visit. This is how a wait handler releases the token it parked.
    pub async fn resume_skipping(&self, token: TokenId) {
        let mut guard = self.sim.inner.state.lock().await;
        let s = &mut *guard;
        s.skip_handler.insert(token);
        s.running = true;
        self.sim.schedule(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::RecordingCanvas;
    use crate::graph::{DiagramBuilder, DiagramRegistry, GatewayDirection};

    fn linear() -> Arc<DiagramRegistry> {
        Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .named_element("task", ElementKind::Task, "Do work")
                .element("end", ElementKind::EndEvent)
                .flow("f0", "start", "task")
                .flow("f1", "task", "end")
                .build(),
        )
    }

    fn fast_config() -> SimulationConfig {
        SimulationConfig {
            delay: Duration::from_millis(10),
            ..SimulationConfig::default()
        }
    }

    fn headless(registry: Arc<DiagramRegistry>) -> Simulation {
        Simulation::headless(registry, fast_config())
    }

    /// Route diagnostics to the test writer; `RUST_LOG` filters as usual.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Step until no tokens remain, bounded to catch non-termination.
    async fn drain(sim: &Simulation) {
        for _ in 0..20 {
            if sim.current_tokens().is_empty() {
                return;
            }
            sim.step().await;
        }
        panic!("simulation did not finish: {:?}", sim.current_tokens());
    }

    fn logged_elements(sim: &Simulation) -> Vec<Option<String>> {
        sim.current_log().iter().map(|e| e.element_id.clone()).collect()
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let sim = headless(linear());
        sim.reset().await;
        sim.reset().await;

        let tokens = sim.current_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].element_id(), Some("start"));
        assert!(!sim.is_running().await);
        assert_eq!(logged_elements(&sim), [Some("start".to_string())]);
    }

    #[tokio::test]
    async fn manual_steps_walk_linear_process_to_completion() {
        let sim = headless(linear());
        sim.reset().await;
        drain(&sim).await;

        assert_eq!(
            logged_elements(&sim),
            [
                Some("start".to_string()),
                Some("task".to_string()),
                Some("end".to_string()),
                None,
            ]
        );
        assert!(!sim.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_advances_tokens_on_its_own() {
        init_tracing();
        let sim = headless(linear());
        sim.start().await;
        assert!(sim.is_running().await);

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            tokio::task::yield_now().await;
            if sim.current_tokens().is_empty() {
                break;
            }
        }

        assert!(sim.current_tokens().is_empty());
        assert!(!sim.is_running().await);
        assert_eq!(sim.current_log().last().unwrap().element_id, None);
    }

    #[tokio::test]
    async fn exclusive_gateway_pauses_until_selection() {
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .gateway("gw", ElementKind::ExclusiveGateway, GatewayDirection::Diverging)
                .element("a", ElementKind::Task)
                .element("b", ElementKind::Task)
                .flow("f0", "start", "gw")
                .flow("fa", "gw", "a")
                .flow("fb", "gw", "b")
                .build(),
        );
        let sim = headless(reg);
        sim.reset().await;
        sim.step().await;
        sim.step().await;

        let paths = sim.current_paths().expect("paths published");
        assert_eq!(paths.gateway_id, "gw");
        assert_eq!(paths.flows.len(), 2);
        assert_eq!(sim.current_tokens()[0].element_id(), Some("gw"));

        // A plain step cannot resolve the decision.
        sim.step().await;
        assert_eq!(sim.current_tokens()[0].element_id(), Some("gw"));

        sim.step_with(&["fb".to_string()]).await;
        assert_eq!(sim.current_tokens()[0].element_id(), Some("b"));
        assert!(sim.current_paths().is_none());
    }

    #[tokio::test]
    async fn conditions_route_without_pausing_when_one_flow_is_viable() {
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .gateway("gw", ElementKind::ExclusiveGateway, GatewayDirection::Diverging)
                .element("a", ElementKind::Task)
                .element("b", ElementKind::Task)
                .flow("f0", "start", "gw")
                .conditional_flow("fa", "gw", "a", "${approved}")
                .conditional_flow("fb", "gw", "b", "${!approved}")
                .build(),
        );
        let sim = headless(reg);
        let mut ctx = Context::new();
        ctx.insert("approved".to_string(), Value::Bool(true));
        sim.set_context(ctx).await;

        sim.reset().await;
        sim.step().await;
        sim.step().await;

        assert!(sim.current_paths().is_none());
        assert_eq!(sim.current_tokens()[0].element_id(), Some("a"));
    }

    #[tokio::test]
    async fn condition_fallback_makes_unresolved_flows_viable() {
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .gateway("gw", ElementKind::ExclusiveGateway, GatewayDirection::Diverging)
                .element("a", ElementKind::Task)
                .element("b", ElementKind::Task)
                .flow("f0", "start", "gw")
                .conditional_flow("fa", "gw", "a", "${high}")
                .conditional_flow("fb", "gw", "b", "${low}")
                .build(),
        );
        let sim = Simulation::headless(
            reg,
            SimulationConfig {
                delay: Duration::from_millis(10),
                condition_fallback: Some(Value::Bool(true)),
                ..SimulationConfig::default()
            },
        );
        sim.reset().await;
        sim.step().await;
        sim.step().await;

        // Both variables are unset; the fallback makes both flows viable,
        // so the gateway must pause with the full pair in source order.
        let paths = sim.current_paths().expect("paths published");
        let ids: Vec<&str> = paths.flows.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, ["fa", "fb"]);
        assert_eq!(sim.current_tokens()[0].element_id(), Some("gw"));
    }

    #[tokio::test]
    async fn single_outgoing_inclusive_gateway_forwards_without_pausing() {
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .gateway("gw", ElementKind::InclusiveGateway, GatewayDirection::Diverging)
                .element("end", ElementKind::EndEvent)
                .flow("f0", "start", "gw")
                .flow("f1", "gw", "end")
                .build(),
        );
        let sim = headless(reg);
        sim.reset().await;
        sim.step().await; // start -> gw
        sim.step().await; // one outgoing flow, no decision to make

        assert!(sim.current_paths().is_none());
        assert_eq!(sim.current_tokens()[0].element_id(), Some("end"));
    }

    #[tokio::test]
    async fn log_subscribers_observe_entries_in_append_order() {
        let sim = headless(linear());
        let mut rx = sim.token_log();
        sim.reset().await;
        drain(&sim).await;

        assert!(rx.has_changed().unwrap());
        let seen: Vec<Option<String>> = rx
            .borrow_and_update()
            .iter()
            .map(|e| e.element_id.clone())
            .collect();
        assert_eq!(
            seen,
            [
                Some("start".to_string()),
                Some("task".to_string()),
                Some("end".to_string()),
                None,
            ]
        );

        let log = sim.current_log();
        assert!(log.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn parallel_split_synchronizes_at_join() {
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .gateway("fork", ElementKind::ParallelGateway, GatewayDirection::Diverging)
                .element("a", ElementKind::Task)
                .element("b", ElementKind::Task)
                .gateway("join", ElementKind::ParallelGateway, GatewayDirection::Converging)
                .element("end", ElementKind::EndEvent)
                .flow("f0", "start", "fork")
                .flow("fa", "fork", "a")
                .flow("fb", "fork", "b")
                .flow("fa2", "a", "join")
                .flow("fb2", "b", "join")
                .flow("fe", "join", "end")
                .build(),
        );
        let sim = headless(reg);
        sim.reset().await;
        sim.step().await; // start -> fork
        sim.step().await; // fork -> a, b
        assert_eq!(sim.current_tokens().len(), 2);

        sim.step().await; // a, b -> join
        let at_join = sim
            .current_tokens()
            .iter()
            .filter(|t| t.element_id() == Some("join"))
            .count();
        assert_eq!(at_join, 2);

        sim.step().await; // join fires, merged token -> end
        let tokens = sim.current_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].element_id(), Some("end"));

        drain(&sim).await;
    }

    #[tokio::test]
    async fn parallel_join_waits_for_straggler_branch() {
        // Branch b takes one extra hop, so the join must hold the first
        // arrival for a full step.
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .gateway("fork", ElementKind::ParallelGateway, GatewayDirection::Diverging)
                .element("a", ElementKind::Task)
                .element("b1", ElementKind::Task)
                .element("b2", ElementKind::Task)
                .gateway("join", ElementKind::ParallelGateway, GatewayDirection::Converging)
                .element("done", ElementKind::Task)
                .flow("f0", "start", "fork")
                .flow("fa", "fork", "a")
                .flow("fb", "fork", "b1")
                .flow("fb12", "b1", "b2")
                .flow("fa2", "a", "join")
                .flow("fb2", "b2", "join")
                .flow("fe", "join", "done")
                .build(),
        );
        let sim = headless(reg);
        sim.reset().await;
        sim.step().await; // -> fork
        sim.step().await; // -> a, b1
        sim.step().await; // a -> join, b1 -> b2

        let ids: Vec<_> = sim
            .current_tokens()
            .iter()
            .filter_map(|t| t.element_id().map(str::to_string))
            .collect();
        assert!(ids.contains(&"join".to_string()));
        assert!(ids.contains(&"b2".to_string()));

        sim.step().await; // join still short one branch; b2 -> join
        let at_join = sim
            .current_tokens()
            .iter()
            .filter(|t| t.element_id() == Some("join"))
            .count();
        assert_eq!(at_join, 2);

        sim.step().await; // fires
        assert_eq!(sim.current_tokens().len(), 1);
        assert_eq!(sim.current_tokens()[0].element_id(), Some("done"));
    }

    #[tokio::test]
    async fn inclusive_partial_selection_joins_on_recorded_expectation() {
        // Three branches, two selected. The converging gateway has three
        // static incoming flows but must fire after the two chosen arrive.
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .gateway("split", ElementKind::InclusiveGateway, GatewayDirection::Diverging)
                .element("a", ElementKind::Task)
                .element("b", ElementKind::Task)
                .element("c", ElementKind::Task)
                .gateway("join", ElementKind::InclusiveGateway, GatewayDirection::Converging)
                .element("end", ElementKind::EndEvent)
                .flow("f0", "start", "split")
                .flow("fa", "split", "a")
                .flow("fb", "split", "b")
                .flow("fc", "split", "c")
                .flow("fa2", "a", "join")
                .flow("fb2", "b", "join")
                .flow("fc2", "c", "join")
                .flow("fe", "join", "end")
                .build(),
        );
        let sim = headless(reg);
        sim.reset().await;
        sim.step().await; // -> split
        sim.step().await; // pauses
        assert!(sim.current_paths().is_some());

        sim.step_with(&["fa".to_string(), "fc".to_string()]).await;
        let tokens = sim.current_tokens();
        assert_eq!(tokens.len(), 2);
        for token in &tokens {
            assert_eq!(token.pending_joins.get("join"), Some(&2));
        }

        sim.step().await; // a, c -> join
        sim.step().await; // join fires with 2 of 3 incoming
        let tokens = sim.current_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].element_id(), Some("end"));
    }

    #[tokio::test]
    async fn markers_track_token_positions_and_traversed_flows() {
        let canvas = Arc::new(RecordingCanvas::new());
        let sim = Simulation::new(
            linear(),
            canvas.clone(),
            Arc::new(MemoryStore::new()),
            fast_config(),
        );
        sim.reset().await;
        assert_eq!(canvas.active_ids(), HashSet::from(["start".to_string()]));

        sim.step().await;
        assert_eq!(
            canvas.active_ids(),
            HashSet::from(["task".to_string(), "f0".to_string()])
        );

        drain(&sim).await;
        assert!(canvas.active_ids().is_empty());
    }

    #[tokio::test]
    async fn log_restores_a_token_across_instances() {
        let store: Arc<dyn LogStore> = Arc::new(MemoryStore::new());
        let registry = linear();

        let sim = Simulation::new(
            registry.clone(),
            Arc::new(NullCanvas),
            store.clone(),
            fast_config(),
        );
        sim.reset().await;
        sim.step().await; // token now at "task"
        let log_before = sim.current_log();
        drop(sim);

        let revived = Simulation::new(registry, Arc::new(NullCanvas), store, fast_config());
        assert_eq!(revived.current_log(), log_before);
        let tokens = revived.current_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].element_id(), Some("task"));

        // The revived session continues from where it left off.
        revived.step().await;
        assert_eq!(revived.current_tokens()[0].element_id(), Some("end"));
    }

    #[tokio::test]
    async fn clear_token_log_wipes_memory_and_store() {
        let store: Arc<dyn LogStore> = Arc::new(MemoryStore::new());
        let sim = Simulation::new(
            linear(),
            Arc::new(NullCanvas),
            store.clone(),
            fast_config(),
        );
        sim.reset().await;
        assert!(!sim.current_log().is_empty());

        sim.clear_token_log().await;
        assert!(sim.current_log().is_empty());
        assert_eq!(
            store.get_item(&SimulationConfig::default().storage_key).unwrap(),
            None
        );
        // Live tokens are untouched.
        assert_eq!(sim.current_tokens().len(), 1);
    }

    #[tokio::test]
    async fn stop_discards_tokens_and_keeps_log() {
        let sim = headless(linear());
        sim.reset().await;
        sim.step().await;
        sim.stop().await;

        assert!(sim.current_tokens().is_empty());
        assert!(!sim.is_running().await);
        assert!(!sim.current_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_handler_holds_token_then_releases_it() {
        init_tracing();
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .element("review", ElementKind::UserTask)
                .element("end", ElementKind::EndEvent)
                .flow("f0", "start", "review")
                .flow("f1", "review", "end")
                .build(),
        );
        let sim = Simulation::headless(
            reg,
            SimulationConfig {
                delay: Duration::from_millis(10),
                wait_delay: Some(Duration::from_millis(50)),
                ..SimulationConfig::default()
            },
        );
        sim.start().await;

        // Let the scheduler carry the token into and through the wait.
        let mut finished = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
            if sim.current_tokens().is_empty() {
                finished = true;
                break;
            }
        }
        assert!(finished, "wait handler never released the token");
        assert_eq!(
            logged_elements(&sim),
            [
                Some("start".to_string()),
                Some("review".to_string()),
                Some("end".to_string()),
                None,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_wait_timers_do_not_accumulate() {
        init_tracing();
        let reg = Arc::new(
            DiagramBuilder::new()
                .element("start", ElementKind::StartEvent)
                .element("w1", ElementKind::UserTask)
                .element("w2", ElementKind::UserTask)
                .element("end", ElementKind::EndEvent)
                .flow("f0", "start", "w1")
                .flow("f1", "w1", "w2")
                .flow("f2", "w2", "end")
                .build(),
        );
        let sim = Simulation::headless(
            reg,
            SimulationConfig {
                delay: Duration::from_millis(10),
                wait_delay: Some(Duration::from_millis(50)),
                ..SimulationConfig::default()
            },
        );
        sim.reset().await;
        sim.step().await; // start -> w1
        sim.step().await; // first wait parks the token
        assert_eq!(sim.inner.state.lock().await.cleanups.len(), 1);

        // The first timer fires, the scheduler carries the token to w2,
        // and the second wait parks it again. The spent first timer must
        // have been dropped when the second was registered.
        let mut parked_at_w2 = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
            let at_w2 = sim
                .current_tokens()
                .first()
                .map(|t| t.element_id() == Some("w2"))
                .unwrap_or(false);
            if at_w2 && !sim.is_running().await {
                parked_at_w2 = true;
                break;
            }
        }
        assert!(parked_at_w2, "token never parked at the second wait");
        assert_eq!(sim.inner.state.lock().await.cleanups.len(), 1);

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
            if sim.current_tokens().is_empty() {
                break;
            }
        }
        assert!(sim.current_tokens().is_empty());
        assert!(sim.inner.state.lock().await.cleanups.is_empty());
    }

    #[tokio::test]
    async fn start_after_finish_begins_a_fresh_run() {
        let sim = headless(linear());
        sim.reset().await;
        drain(&sim).await;
        let first_run_len = sim.current_log().len();

        sim.start().await;
        sim.pause().await;
        let tokens = sim.current_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].element_id(), Some("start"));
        assert!(sim.current_log().len() > first_run_len);
    }
}
