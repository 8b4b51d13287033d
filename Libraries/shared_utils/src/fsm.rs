// fsm.rs

//! Generic, data-driven finite-state engine.
//!
//! A [`StateManager`] owns any number of named [`StateHandler`]s (the state/event/callback
//! tables) and the registry of live [`StateUnit`]s. Handlers are filled in once at startup and
//! only read afterwards; units come and go with the sessions they belong to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    #[error("state handler not found: {0}")]
    UnknownHandler(String),

    #[error("state handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("state {state} is already registered in {handler}")]
    DuplicateState { handler: String, state: String },

    #[error("{handler} already has an initial state ({existing})")]
    DuplicateInitialState { handler: String, existing: String },

    #[error("{handler} already has a terminal state ({existing})")]
    DuplicateTerminalState { handler: String, existing: String },

    #[error("state {state} is not registered in {handler}")]
    UnknownState { handler: String, state: String },

    #[error("callback for ({state}, {event}) is already registered in {handler}")]
    DuplicateCallback {
        handler: String,
        state: String,
        event: String,
    },

    #[error("state unit already exists: {0}")]
    DuplicateUnit(String),
}

pub type FsmResult<T> = Result<T, FsmError>;

/// Transition callback. Returns the label of the next state, or `None` to stay put.
pub type CallBack<T> = Arc<dyn Fn(&mut StateUnit<T>) -> Option<String> + Send + Sync>;

/// Shared handle to one state unit. The mutex is what serializes transitions per unit.
pub type StateUnitRef<T> = Arc<Mutex<StateUnit<T>>>;

/// Locks a unit, recovering the guard if a previous holder panicked.
pub fn lock_unit<T>(unit: &StateUnitRef<T>) -> MutexGuard<'_, StateUnit<T>> {
    unit.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StateHandler<T> {
    name: String,
    states: Vec<String>,
    initial_state: Option<String>,
    terminal_state: Option<String>,
    // state -> event -> callback
    callbacks: HashMap<String, HashMap<String, CallBack<T>>>,
}

impl<T> StateHandler<T> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            states: Vec::new(),
            initial_state: None,
            terminal_state: None,
            callbacks: HashMap::new(),
        }
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn has_callback(&self, state: &str, event: &str) -> bool {
        self.callbacks
            .get(state)
            .is_some_and(|events| events.contains_key(event))
    }

    fn callback(&self, state: &str, event: &str) -> Option<CallBack<T>> {
        self.callbacks.get(state)?.get(event).cloned()
    }
}

impl<T> std::fmt::Debug for StateHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandler")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("initial_state", &self.initial_state)
            .field("terminal_state", &self.terminal_state)
            .field("callbacks", &self.callbacks.values().map(HashMap::len).sum::<usize>())
            .finish()
    }
}

/// One running instance of a state machine: identity, current state and owner payload.
#[derive(Debug)]
pub struct StateUnit<T> {
    id: String,
    handler_name: String,
    cur_state: String,
    prev_state: Option<String>,
    data: T,
}

impl<T> StateUnit<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn cur_state(&self) -> &str {
        &self.cur_state
    }

    pub fn prev_state(&self) -> Option<&str> {
        self.prev_state.as_deref()
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

pub struct StateManager<T> {
    handlers: DashMap<String, StateHandler<T>>,
    units: DashMap<String, StateUnitRef<T>>,
}

impl<T> Default for StateManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for StateManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("handlers", &self.handlers.len())
            .field("units", &self.units.len())
            .finish()
    }
}

impl<T> StateManager<T> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            units: DashMap::new(),
        }
    }

    pub fn add_state_handler(&self, handler_name: &str) -> FsmResult<()> {
        match self.handlers.entry(handler_name.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(FsmError::DuplicateHandler(handler_name.to_owned()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(StateHandler::new(handler_name));
                Ok(())
            }
        }
    }

    /// Declares a state. A handler has at most one initial and one terminal state.
    pub fn register_state(
        &self,
        handler_name: &str,
        state: &str,
        is_initial: bool,
        is_terminal: bool,
    ) -> FsmResult<()> {
        let mut handler = self
            .handlers
            .get_mut(handler_name)
            .ok_or_else(|| FsmError::UnknownHandler(handler_name.to_owned()))?;

        if handler.has_state(state) {
            return Err(FsmError::DuplicateState {
                handler: handler_name.to_owned(),
                state: state.to_owned(),
            });
        }
        if is_initial {
            if let Some(existing) = &handler.initial_state {
                return Err(FsmError::DuplicateInitialState {
                    handler: handler_name.to_owned(),
                    existing: existing.clone(),
                });
            }
        }
        if is_terminal {
            if let Some(existing) = &handler.terminal_state {
                return Err(FsmError::DuplicateTerminalState {
                    handler: handler_name.to_owned(),
                    existing: existing.clone(),
                });
            }
        }

        handler.states.push(state.to_owned());
        if is_initial {
            handler.initial_state = Some(state.to_owned());
        }
        if is_terminal {
            handler.terminal_state = Some(state.to_owned());
        }
        Ok(())
    }

    pub fn register_callback<F>(
        &self,
        handler_name: &str,
        state: &str,
        event: &str,
        callback: F,
    ) -> FsmResult<()>
    where
        F: Fn(&mut StateUnit<T>) -> Option<String> + Send + Sync + 'static,
    {
        let mut handler = self
            .handlers
            .get_mut(handler_name)
            .ok_or_else(|| FsmError::UnknownHandler(handler_name.to_owned()))?;

        if !handler.has_state(state) {
            return Err(FsmError::UnknownState {
                handler: handler_name.to_owned(),
                state: state.to_owned(),
            });
        }
        if handler.has_callback(state, event) {
            return Err(FsmError::DuplicateCallback {
                handler: handler_name.to_owned(),
                state: state.to_owned(),
                event: event.to_owned(),
            });
        }

        handler
            .callbacks
            .entry(state.to_owned())
            .or_default()
            .insert(event.to_owned(), Arc::new(callback));
        Ok(())
    }

    pub fn initial_state(&self, handler_name: &str) -> Option<String> {
        self.handlers
            .get(handler_name)
            .and_then(|h| h.initial_state.clone())
    }

    pub fn has_state_handler(&self, handler_name: &str) -> bool {
        self.handlers.contains_key(handler_name)
    }

    /// Fires `event` on `unit`.
    ///
    /// Looks up the callback bound to `(current state, event)`. Without one, the event is
    /// dropped and the unit is left untouched. Otherwise the callback runs while the unit is
    /// locked, and a returned label becomes the new current state. Entering the handler's
    /// terminal state releases the unit from the registry.
    ///
    /// Returns the new state if a transition happened.
    pub fn fire(&self, handler_name: &str, event: &str, unit: &StateUnitRef<T>) -> Option<String> {
        let mut guard = lock_unit(unit);
        let cur_state = guard.cur_state.clone();

        let (callback, terminal_state, known_states) = {
            let Some(handler) = self.handlers.get(handler_name) else {
                warn!("State handler {} is not registered, dropping event {}", handler_name, event);
                return None;
            };
            let Some(callback) = handler.callback(&cur_state, event) else {
                debug!(
                    "({}) No transition for ({}, {}) in {}",
                    guard.id, cur_state, event, handler_name
                );
                return None;
            };
            (callback, handler.terminal_state.clone(), handler.states.clone())
        };

        let next_state = callback(&mut *guard)?;
        if !known_states.contains(&next_state) {
            warn!(
                "({}) Callback for ({}, {}) returned unregistered state {}",
                guard.id, cur_state, event, next_state
            );
            return None;
        }

        trace!("({}) {} --[{}]--> {}", guard.id, cur_state, event, next_state);
        guard.prev_state = Some(cur_state);
        guard.cur_state = next_state.clone();

        if terminal_state.as_deref() == Some(next_state.as_str()) {
            let unit_id = guard.id.clone();
            drop(guard);
            if self
                .units
                .remove_if(&unit_id, |_, registered| Arc::ptr_eq(registered, unit))
                .is_some()
            {
                debug!("({}) Reached terminal state {}, unit released", unit_id, next_state);
            }
        }

        Some(next_state)
    }

    pub fn create_unit(
        &self,
        id: &str,
        handler_name: &str,
        data: T,
        initial_state: &str,
    ) -> FsmResult<StateUnitRef<T>> {
        {
            let handler = self
                .handlers
                .get(handler_name)
                .ok_or_else(|| FsmError::UnknownHandler(handler_name.to_owned()))?;
            if !handler.has_state(initial_state) {
                return Err(FsmError::UnknownState {
                    handler: handler_name.to_owned(),
                    state: initial_state.to_owned(),
                });
            }
        }

        match self.units.entry(id.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(FsmError::DuplicateUnit(id.to_owned())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let unit = Arc::new(Mutex::new(StateUnit {
                    id: id.to_owned(),
                    handler_name: handler_name.to_owned(),
                    cur_state: initial_state.to_owned(),
                    prev_state: None,
                    data,
                }));
                entry.insert(unit.clone());
                debug!("({}) State unit created in {} ({})", id, handler_name, initial_state);
                Ok(unit)
            }
        }
    }

    pub fn get_unit(&self, id: &str) -> Option<StateUnitRef<T>> {
        self.units.get(id).map(|unit| unit.value().clone())
    }

    pub fn remove_unit(&self, id: &str) -> Option<StateUnitRef<T>> {
        self.units.remove(id).map(|(_, unit)| unit)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}
