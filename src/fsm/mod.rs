//! Event-driven state machine engine.
//!
//! States and events are small integers with optional display names. A
//! transition is keyed by `(state, event)` and may carry ordered, numbered
//! actions; every fired transition is reported to a trace callback. The
//! machine is generic over a context type `C`: actions receive `&mut C`
//! instead of capturing the owning engine, which is what lets a server thread
//! its own mutable state through the machines it drives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::Result;

pub type State = u16;
pub type Event = u16;

/// Immutable description of a registered transition, handed to actions and
/// the trace callback.
#[derive(Debug, Clone)]
pub struct TransitionInfo {
    pub state: State,
    pub event: Event,
    pub next_state: State,
    pub description: String,
}

/// Observer invoked once per fired action (or once per fired transition when
/// it has no actions): `(seqno, description, transition, machine name)`.
pub type TraceFn = Arc<dyn Fn(u16, &str, &TransitionInfo, &str) + Send + Sync>;

/// The default observer: does nothing.
pub fn no_trace() -> TraceFn {
    Arc::new(|_, _, _, _| {})
}

type ActionFn<C> = Box<dyn FnMut(&mut C, u16, &TransitionInfo, &mut EventQueue) -> Result<()> + Send>;

// =============================================================================
// Event queue
// =============================================================================

/// Pending events of one machine. Actions receive it so a firing transition
/// can feed the machine further events.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn enqueue(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Enqueue only when nothing is pending; keeps idempotent signals from
    /// piling up.
    pub fn enqueue_if_empty(&mut self, event: Event) {
        if self.events.is_empty() {
            self.events.push_back(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
}

// =============================================================================
// Transitions
// =============================================================================

struct Action<C> {
    seqno: u16,
    description: String,
    run: ActionFn<C>,
}

/// One `(state, event) -> next_state` edge with its ordered actions.
pub struct Transition<C> {
    info: TransitionInfo,
    actions: Vec<Action<C>>,
}

impl<C> Transition<C> {
    pub fn new(state: State, event: Event, next_state: State, description: &str) -> Self {
        Self {
            info: TransitionInfo {
                state,
                event,
                next_state,
                description: description.to_string(),
            },
            actions: Vec::new(),
        }
    }

    /// Register an action under `seqno`; actions fire in ascending seqno
    /// order and a repeated seqno replaces the earlier registration.
    pub fn set_action<F>(&mut self, seqno: u16, description: &str, action: F)
    where
        F: FnMut(&mut C, u16, &TransitionInfo, &mut EventQueue) -> Result<()> + Send + 'static,
    {
        let action = Action {
            seqno,
            description: description.to_string(),
            run: Box::new(action),
        };
        match self.actions.binary_search_by_key(&seqno, |a| a.seqno) {
            Ok(i) => self.actions[i] = action,
            Err(i) => self.actions.insert(i, action),
        }
    }

    /// Builder-style [`set_action`](Self::set_action).
    pub fn with_action<F>(mut self, seqno: u16, description: &str, action: F) -> Self
    where
        F: FnMut(&mut C, u16, &TransitionInfo, &mut EventQueue) -> Result<()> + Send + 'static,
    {
        self.set_action(seqno, description, action);
        self
    }
}

// =============================================================================
// State machine
// =============================================================================

pub struct StateMachine<C> {
    description: String,
    state_names: HashMap<State, String>,
    event_names: HashMap<Event, String>,
    transitions: HashMap<(State, Event), Transition<C>>,
    queue: EventQueue,
    trace: TraceFn,
}

impl<C> StateMachine<C> {
    pub fn new(description: impl Into<String>, trace: TraceFn) -> Self {
        Self {
            description: description.into(),
            state_names: HashMap::new(),
            event_names: HashMap::new(),
            transitions: HashMap::new(),
            queue: EventQueue::default(),
            trace,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state_name(&mut self, state: State, name: &str) {
        self.state_names.insert(state, name.to_string());
    }

    pub fn event_name(&mut self, event: Event, name: &str) {
        self.event_names.insert(event, name.to_string());
    }

    pub fn state_label(&self, state: State) -> &str {
        self.state_names.get(&state).map_or("?", String::as_str)
    }

    pub fn event_label(&self, event: Event) -> &str {
        self.event_names.get(&event).map_or("?", String::as_str)
    }

    /// Register a transition; the last registration for a `(state, event)`
    /// pair wins.
    pub fn add_transition(&mut self, transition: Transition<C>) {
        let key = (transition.info.state, transition.info.event);
        self.transitions.insert(key, transition);
    }

    pub fn enqueue(&mut self, event: Event) {
        self.queue.enqueue(event);
    }

    pub fn enqueue_if_empty(&mut self, event: Event) {
        self.queue.enqueue_if_empty(event);
    }

    pub fn has_pending_events(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Drain the event queue from `start`, returning the state reached.
    ///
    /// Events with no transition registered for the current state are traced
    /// and ignored. An action error aborts the run and propagates; events
    /// still queued (including any the failing action enqueued) stay queued
    /// for the next run.
    pub fn run(&mut self, start: State, ctx: &mut C) -> Result<State> {
        let mut current = start;
        while let Some(event) = self.queue.pop() {
            let Some(transition) = self.transitions.get_mut(&(current, event)) else {
                tracing::trace!(
                    machine = %self.description,
                    state = current,
                    event,
                    "event without transition ignored"
                );
                continue;
            };

            let info = transition.info.clone();
            if transition.actions.is_empty() {
                (self.trace)(0, &info.description, &info, &self.description);
            } else {
                for action in transition.actions.iter_mut() {
                    (self.trace)(action.seqno, &action.description, &info, &self.description);
                    (action.run)(ctx, action.seqno, &info, &mut self.queue)?;
                }
            }
            current = info.next_state;
        }
        Ok(current)
    }
}

// =============================================================================
// Tests
// =============================================================================
