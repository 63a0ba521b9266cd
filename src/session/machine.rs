//! Table-driven session state machine
//!
//! The machine is generic over its state and event alphabet. The owning
//! application registers every state once at startup with its entry, exit
//! and per-tick hooks, an optional timeout, and an ordered list of rules.
//!
//! Events are never applied on post. They wait in a FIFO until the next
//! [`StateMachine::update`], which runs in this order:
//!
//! 1. timeout check for the active state
//! 2. a snapshot of the queued events, each matched against the active
//!    state's rules in declared order (first rule whose event matches and
//!    whose guard holds wins; its action runs before the state changes)
//! 3. the active state's update hook
//!
//! Events posted while a tick is processing are handled on the next tick.
//! Hooks and actions cannot reach the machine itself, so a hook that wants
//! a chained transition posts an event through an [`EventSender`].

use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::TransitionError;

/// Events carry a discriminant that rules match on
pub trait MachineEvent: Send + 'static {
    type Kind: Copy + Eq + Debug + Send;

    fn kind(&self) -> Self::Kind;
}

/// State identifiers
pub trait MachineState: Copy + Eq + Hash + Debug + Send + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + 'static> MachineState for T {}

pub type Guard<E> = Box<dyn Fn(&E) -> bool + Send>;
pub type Action<E> = Box<dyn FnMut(&E) + Send>;
pub type Hook = Box<dyn FnMut() + Send>;
pub type ChangeHook<S> = Box<dyn FnMut(S, S) + Send>;

/// One transition rule
pub struct Rule<S: MachineState, E: MachineEvent> {
    on: E::Kind,
    target: S,
    guard: Option<Guard<E>>,
    action: Option<Action<E>>,
}

impl<S: MachineState, E: MachineEvent> Rule<S, E> {
    pub fn on(kind: E::Kind, target: S) -> Self {
        Self {
            on: kind,
            target,
            guard: None,
            action: None,
        }
    }

    /// Only apply when `guard` holds. Guards must be side-effect free.
    pub fn when(mut self, guard: impl Fn(&E) -> bool + Send + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Run `action` before leaving the current state
    pub fn then(mut self, action: impl FnMut(&E) + Send + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }

    fn matches(&self, event: &E) -> bool {
        self.on == event.kind() && self.guard.as_ref().map_or(true, |guard| guard(event))
    }
}

/// A registered state and everything attached to it
pub struct StateConfig<S: MachineState, E: MachineEvent> {
    id: S,
    entry: Option<Hook>,
    exit: Option<Hook>,
    update: Option<Hook>,
    timeout: Option<(u64, S)>,
    rules: Vec<Rule<S, E>>,
}

impl<S: MachineState, E: MachineEvent> StateConfig<S, E> {
    pub fn new(id: S) -> Self {
        Self {
            id,
            entry: None,
            exit: None,
            update: None,
            timeout: None,
            rules: Vec::new(),
        }
    }

    pub fn on_entry(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.entry = Some(Box::new(hook));
        self
    }

    pub fn on_exit(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.exit = Some(Box::new(hook));
        self
    }

    /// Called once per tick while this state is active
    pub fn on_update(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.update = Some(Box::new(hook));
        self
    }

    /// Leave for `target` after `ms` milliseconds in this state
    pub fn timeout(mut self, ms: u64, target: S) -> Self {
        self.timeout = Some((ms, target));
        self
    }

    /// Unconditional transition on `kind`
    pub fn on(self, kind: E::Kind, target: S) -> Self {
        self.rule(Rule::on(kind, target))
    }

    pub fn rule(mut self, rule: Rule<S, E>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn id(&self) -> S {
        self.id
    }
}

/// Cloneable handle for posting events from other contexts
pub struct EventSender<E> {
    queue: Arc<Mutex<VecDeque<E>>>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<E> EventSender<E> {
    pub fn post(&self, event: E) {
        self.queue.lock().push_back(event);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Clears the in-transition flag however the transition ends
struct TransitionGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> TransitionGuard<'a> {
    fn acquire(flag: &'a Cell<bool>) -> Result<Self, TransitionError> {
        if flag.replace(true) {
            return Err(TransitionError::InProgress);
        }
        Ok(Self { flag })
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Machine counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineStats {
    pub transitions: u64,
    pub timeouts: u64,
    pub events_processed: u64,
    pub events_unhandled: u64,
}

pub struct StateMachine<S: MachineState, E: MachineEvent> {
    states: HashMap<S, StateConfig<S, E>>,
    current: S,
    previous: Option<S>,
    entered_at: u64,
    last_tick: u64,
    started: bool,
    transitioning: Cell<bool>,
    queue: Arc<Mutex<VecDeque<E>>>,
    on_change: Option<ChangeHook<S>>,
    stats: MachineStats,
}

impl<S: MachineState, E: MachineEvent> StateMachine<S, E> {
    pub fn new(initial: S) -> Self {
        Self {
            states: HashMap::new(),
            current: initial,
            previous: None,
            entered_at: 0,
            last_tick: 0,
            started: false,
            transitioning: Cell::new(false),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            on_change: None,
            stats: MachineStats::default(),
        }
    }

    /// Register a state. Re-registering an id replaces the earlier config.
    pub fn add_state(&mut self, state: StateConfig<S, E>) -> &mut Self {
        self.states.insert(state.id, state);
        self
    }

    /// Callback run after every completed transition with `(from, to)`
    pub fn on_state_change(&mut self, hook: impl FnMut(S, S) + Send + 'static) -> &mut Self {
        self.on_change = Some(Box::new(hook));
        self
    }

    /// Enter the initial state at `now`
    pub fn start(&mut self, now: u64) -> Result<(), TransitionError> {
        if self.started {
            return Ok(());
        }
        let _guard = TransitionGuard::acquire(&self.transitioning)?;
        let state = self
            .states
            .get_mut(&self.current)
            .ok_or(TransitionError::UnknownState)?;

        self.started = true;
        self.last_tick = now;
        self.entered_at = now;
        if let Some(entry) = state.entry.as_mut() {
            entry();
        }
        info!(state = ?self.current, "State machine started");
        Ok(())
    }

    /// Leave the current state and drop pending events
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        if let Some(exit) = self
            .states
            .get_mut(&self.current)
            .and_then(|s| s.exit.as_mut())
        {
            exit();
        }
        self.queue.lock().clear();
        self.started = false;
        info!(state = ?self.current, "State machine stopped");
    }

    /// Queue an event for the next [`update`](Self::update)
    pub fn post_event(&self, event: E) {
        self.queue.lock().push_back(event);
    }

    pub fn sender(&self) -> EventSender<E> {
        EventSender {
            queue: self.queue.clone(),
        }
    }

    /// Run one tick at `now`. The first tick starts the machine if needed.
    pub fn update(&mut self, now: u64) {
        if !self.started {
            if let Err(e) = self.start(now) {
                warn!(state = ?self.current, "Cannot start state machine: {}", e);
                return;
            }
        }
        self.last_tick = now;

        self.check_timeout(now);

        let pending: Vec<E> = self.queue.lock().drain(..).collect();
        for event in pending {
            self.dispatch(event);
        }

        if let Some(update) = self
            .states
            .get_mut(&self.current)
            .and_then(|s| s.update.as_mut())
        {
            update();
        }
    }

    fn check_timeout(&mut self, now: u64) {
        let Some((ms, target)) = self.states.get(&self.current).and_then(|s| s.timeout) else {
            return;
        };
        if now.saturating_sub(self.entered_at) < ms {
            return;
        }

        debug!(state = ?self.current, timeout_ms = ms, "State timed out");
        self.stats.timeouts += 1;
        if let Err(e) = self.force_transition(target) {
            warn!(from = ?self.current, to = ?target, "Timeout transition failed: {}", e);
        }
    }

    fn dispatch(&mut self, event: E) {
        self.stats.events_processed += 1;
        let kind = event.kind();

        let Some(state) = self.states.get_mut(&self.current) else {
            return;
        };
        let Some(rule) = state.rules.iter_mut().find(|r| r.matches(&event)) else {
            self.stats.events_unhandled += 1;
            debug!(state = ?self.current, event = ?kind, "No rule for event");
            return;
        };

        let target = rule.target;
        if let Some(action) = rule.action.as_mut() {
            action(&event);
        }

        if let Err(e) = self.transition_to(target) {
            warn!(from = ?self.current, to = ?target, event = ?kind, "Transition failed: {}", e);
        }
    }

    /// Move to `target`. Already being there is a successful no-op.
    pub fn transition_to(&mut self, target: S) -> Result<(), TransitionError> {
        if target == self.current && self.states.contains_key(&target) {
            return Ok(());
        }
        self.perform(target)
    }

    /// Move to `target` even if it is the current state, re-running exit
    /// and entry hooks
    pub fn force_transition(&mut self, target: S) -> Result<(), TransitionError> {
        self.perform(target)
    }

    fn perform(&mut self, target: S) -> Result<(), TransitionError> {
        if !self.states.contains_key(&target) {
            return Err(TransitionError::UnknownState);
        }
        let _guard = TransitionGuard::acquire(&self.transitioning)?;

        let from = self.current;
        if let Some(exit) = self.states.get_mut(&from).and_then(|s| s.exit.as_mut()) {
            exit();
        }

        self.previous = Some(from);
        self.current = target;
        self.entered_at = self.last_tick;
        self.stats.transitions += 1;
        info!(from = ?from, to = ?target, "State transition");

        if let Some(entry) = self.states.get_mut(&target).and_then(|s| s.entry.as_mut()) {
            entry();
        }
        if let Some(on_change) = self.on_change.as_mut() {
            on_change(from, target);
        }
        Ok(())
    }

    pub fn current_state(&self) -> S {
        self.current
    }

    pub fn previous_state(&self) -> Option<S> {
        self.previous
    }

    pub fn is_in(&self, state: S) -> bool {
        self.current == state
    }

    /// Milliseconds spent in the current state as of `now`
    pub fn time_in_state(&self, now: u64) -> u64 {
        now.saturating_sub(self.entered_at)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn has_state(&self, state: S) -> bool {
        self.states.contains_key(&state)
    }

    pub fn pending_events(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn stats(&self) -> &MachineStats {
        &self.stats
    }
}
