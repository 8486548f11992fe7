//! Core state machine implementation
//!
//! A table-driven machine shared by the client and server conversation
//! lifecycles. State only ever changes along an edge of the legal-transition
//! table; anything else is rejected, logged and left as a no-op.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A closed set of states with a legal-transition table
pub trait Lifecycle: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + 'static {
    /// States reachable from `self` in one step
    fn legal_next(self) -> &'static [Self];

    /// Every state, used for exhaustive checks and path search
    fn all() -> &'static [Self];
}

type EnterHook<S> = Box<dyn FnMut(S) + Send>;

/// The state machine that guards lifecycle transitions
pub struct StateMachine<S: Lifecycle> {
    /// Current state
    state: S,
    /// Time when the current state was entered
    state_entered_at: Instant,
    /// Callbacks run synchronously on entering a state (receive the previous state)
    on_enter: HashMap<S, EnterHook<S>>,
}

impl<S: Lifecycle> StateMachine<S> {
    /// Create a new state machine in `initial`
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            state_entered_at: Instant::now(),
            on_enter: HashMap::new(),
        }
    }

    /// Get the current state
    pub fn current(&self) -> S {
        self.state
    }

    /// Pure legality check, no side effects
    pub fn can_transition_to(&self, target: S) -> bool {
        self.state.legal_next().contains(&target)
    }

    /// Register a callback for entering `state`, replacing any previous one
    pub fn on_enter(&mut self, state: S, hook: impl FnMut(S) + Send + 'static) {
        self.on_enter.insert(state, Box::new(hook));
    }

    /// Perform a single-step transition
    ///
    /// Returns `false` and leaves the state untouched if `target` is not
    /// adjacent to the current state. On success the enter hook for `target`
    /// runs before this returns.
    pub fn transition_to(&mut self, target: S) -> bool {
        let old_state = self.state;

        if !self.can_transition_to(target) {
            warn!(from = %old_state, to = %target, "invalid state transition attempted");
            return false;
        }

        info!(
            from = %old_state,
            to = %target,
            duration_ms = self.state_entered_at.elapsed().as_millis() as u64,
            "state transition"
        );

        self.state = target;
        self.state_entered_at = Instant::now();

        if let Some(hook) = self.on_enter.get_mut(&target) {
            hook(old_state);
        }

        true
    }

    /// Move to `target` along the shortest chain of legal transitions
    ///
    /// Every intermediate step goes through [`transition_to`](Self::transition_to),
    /// so enter hooks fire in order. Returns `true` if the machine ends in
    /// `target` (including when it was already there).
    pub fn walk_to(&mut self, target: S) -> bool {
        if self.state == target {
            return true;
        }

        let Some(path) = shortest_path(self.state, target) else {
            warn!(from = %self.state, to = %target, "no legal path between states");
            return false;
        };

        debug!(from = %self.state, to = %target, steps = path.len(), "walking state path");
        path.into_iter().all(|step| self.transition_to(step))
    }
}

/// Breadth-first search over the transition table; excludes `from` itself
fn shortest_path<S: Lifecycle>(from: S, to: S) -> Option<Vec<S>> {
    let mut previous: HashMap<S, S> = HashMap::new();
    let mut seen: HashSet<S> = HashSet::from([from]);
    let mut queue = VecDeque::from([from]);

    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut path = vec![to];
            let mut cursor = to;
            while let Some(&prev) = previous.get(&cursor) {
                if prev == from {
                    break;
                }
                path.push(prev);
                cursor = prev;
            }
            path.reverse();
            return Some(path);
        }

        for &next in node.legal_next() {
            if seen.insert(next) {
                previous.insert(next, node);
                queue.push_back(next);
            }
        }
    }

    None
}
