//! Lifecycle state of a proxied resource

use parking_lot::Mutex;
use std::fmt;

/// Where a proxied resource is in its lifecycle
///
/// `Created -> Active -> (Paused <-> Active) -> Closed`. Only producers and
/// consumers pause. `Closed` is terminal and reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Exists on the worker but not yet usable (transport before `connect`)
    Created,
    /// Usable
    Active,
    /// Media flow paused
    Paused,
    /// Gone; never leaves this state
    Closed,
}

impl ResourceState {
    /// Whether moving to `next` is allowed
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Created, Active) => true,
            (Active, Paused) | (Paused, Active) => true,
            (current, next) => current == next,
        }
    }

    /// Whether the resource is gone
    pub fn is_closed(self) -> bool {
        self == ResourceState::Closed
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceState::Created => "created",
            ResourceState::Active => "active",
            ResourceState::Paused => "paused",
            ResourceState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared, lock-protected state of one proxy
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<ResourceState>);

impl StateCell {
    pub(crate) fn new(initial: ResourceState) -> Self {
        Self(Mutex::new(initial))
    }

    pub(crate) fn get(&self) -> ResourceState {
        *self.0.lock()
    }

    /// Move to `next` when allowed; returns whether the state is now `next`
    pub(crate) fn transition(&self, next: ResourceState) -> bool {
        let mut state = self.0.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        true
    }

    /// Mark closed; returns `false` when it already was
    pub(crate) fn close(&self) -> bool {
        let mut state = self.0.lock();
        if state.is_closed() {
            return false;
        }
        *state = ResourceState::Closed;
        true
    }
}
