//! Generic finite state machine mapping (state, command) -> state with enter/exit
//!  hooks. The transition table is declared up front and validated when the machine is
//!  built; `apply` is atomic with respect to concurrent `apply` calls.

use rustc_hash::FxHashMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::sync::Mutex;

/// A command was applied for which the current state has no transition. Callers rely
///  on this to detect protocol violations, so a missing edge is never a silent no-op.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InvalidTransition<S, C> {
    pub state: S,
    pub command: C,
}

impl<S: Debug, C: Debug> Display for InvalidTransition<S, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "command {:?} is not a valid transition in state {:?}",
            self.command, self.state
        )
    }
}

impl<S: Debug, C: Debug> std::error::Error for InvalidTransition<S, C> {}

type Hook = Box<dyn Fn() + Send + Sync>;

pub struct StateMachineBuilder<S, C> {
    initial_state: S,
    transitions: FxHashMap<(S, C), S>,
    enter_hooks: FxHashMap<S, Vec<Hook>>,
    exit_hooks: FxHashMap<S, Vec<Hook>>,
    duplicate_edge: Option<(S, C)>,
}

impl<S, C> StateMachineBuilder<S, C>
where
    S: Copy + Eq + Hash + Debug + Send + 'static,
    C: Copy + Eq + Hash + Debug + Send + 'static,
{
    pub fn new(initial_state: S) -> StateMachineBuilder<S, C> {
        StateMachineBuilder {
            initial_state,
            transitions: Default::default(),
            enter_hooks: Default::default(),
            exit_hooks: Default::default(),
            duplicate_edge: None,
        }
    }

    pub fn add(mut self, from: S, command: C, to: S) -> Self {
        if self.transitions.insert((from, command), to).is_some() && self.duplicate_edge.is_none() {
            self.duplicate_edge = Some((from, command));
        }
        self
    }

    pub fn on_enter(mut self, state: S, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.enter_hooks.entry(state).or_default().push(Box::new(hook));
        self
    }

    pub fn on_exit(mut self, state: S, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.exit_hooks.entry(state).or_default().push(Box::new(hook));
        self
    }

    /// Validates the declared table; duplicate (from, command) edges are rejected here
    ///  rather than surfacing as surprising behavior at run time.
    pub fn build(self) -> anyhow::Result<StateMachine<S, C>> {
        if let Some((from, command)) = self.duplicate_edge {
            anyhow::bail!(
                "duplicate transition declared for command {:?} in state {:?}",
                command,
                from
            );
        }

        Ok(StateMachine {
            current_state: Mutex::new(self.initial_state),
            transitions: self.transitions,
            enter_hooks: self.enter_hooks,
            exit_hooks: self.exit_hooks,
        })
    }
}

pub struct StateMachine<S, C> {
    current_state: Mutex<S>,
    transitions: FxHashMap<(S, C), S>,
    enter_hooks: FxHashMap<S, Vec<Hook>>,
    exit_hooks: FxHashMap<S, Vec<Hook>>,
}

impl<S, C> StateMachine<S, C>
where
    S: Copy + Eq + Hash + Debug + Send + 'static,
    C: Copy + Eq + Hash + Debug + Send + 'static,
{
    pub fn state(&self) -> S {
        *self.current_state.lock().unwrap()
    }

    /// Applies `command`, running the current state's exit hooks and the target
    ///  state's enter hooks before the state is updated. The whole sequence happens
    ///  under a single lock, so hooks must be fast and non-blocking.
    pub fn apply(&self, command: C) -> Result<S, InvalidTransition<S, C>> {
        let mut current = self.current_state.lock().unwrap();

        let next = *self
            .transitions
            .get(&(*current, command))
            .ok_or(InvalidTransition {
                state: *current,
                command,
            })?;

        if let Some(hooks) = self.exit_hooks.get(&*current) {
            for hook in hooks {
                hook();
            }
        }
        if let Some(hooks) = self.enter_hooks.get(&next) {
            for hook in hooks {
                hook();
            }
        }

        *current = next;
        Ok(next)
    }
}
