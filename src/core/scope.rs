use super::pool::Lease;
use std::collections::HashMap;
use std::fmt;

/// Fully resolved `(group, key)` identity of a shard within one scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffinityToken {
    pub group: String,
    pub key: String,
}

impl AffinityToken {
    pub fn new(group: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for AffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.key)
    }
}

/// Runs once when the scope ends
pub type ExitHook = Box<dyn FnOnce(&mut TaskScope) + Send>;

/// Per-task affinity state.
///
/// A scope holds at most one lease per token plus the "last used" tokens the
/// manager consults when a call names no shard. Exit hooks run in reverse
/// registration order when the scope is closed or dropped, including when
/// the owning task is cancelled.
#[derive(Default)]
pub struct TaskScope {
    leases: HashMap<AffinityToken, Lease>,
    last: Option<AffinityToken>,
    last_by_group: HashMap<String, AffinityToken>,
    hooks: Vec<ExitHook>,
}

impl TaskScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holds(&self, token: &AffinityToken) -> bool {
        self.leases.contains_key(token)
    }

    pub fn lease_mut(&mut self, token: &AffinityToken) -> Option<&mut Lease> {
        self.leases.get_mut(token)
    }

    /// Store a lease under `token` and register the hook that hands it back
    pub fn attach(&mut self, token: AffinityToken, lease: Lease, hook: ExitHook) {
        tracing::trace!("Scope borrowed {:?} for {}", lease, token);
        if let Some(previous) = self.leases.insert(token, lease) {
            tracing::warn!("Scope replaced an attached lease {:?}", previous);
        }
        self.hooks.push(hook);
    }

    pub fn take(&mut self, token: &AffinityToken) -> Option<Lease> {
        self.leases.remove(token)
    }

    /// Number of leases currently held
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Last token used in this scope
    pub fn last(&self) -> Option<&AffinityToken> {
        self.last.as_ref()
    }

    /// Last token used for `group` in this scope
    pub fn last_for(&self, group: &str) -> Option<&AffinityToken> {
        self.last_by_group.get(group)
    }

    pub fn remember(&mut self, token: &AffinityToken) {
        self.last_by_group.insert(token.group.clone(), token.clone());
        self.last = Some(token.clone());
    }

    pub fn on_exit<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut TaskScope) + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// End the scope, running its exit hooks
    pub fn close(mut self) {
        self.run_exit_hooks();
    }

    fn run_exit_hooks(&mut self) {
        // Hooks may register further hooks; those run too
        while let Some(hook) = self.hooks.pop() {
            hook(self);
        }
        if !self.leases.is_empty() {
            tracing::debug!("Scope dropping {} unreturned leases", self.leases.len());
            self.leases.clear();
        }
        self.last = None;
        self.last_by_group.clear();
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        self.run_exit_hooks();
    }
}

impl fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<String> = self.leases.keys().map(ToString::to_string).collect();
        tokens.sort();
        f.debug_struct("TaskScope")
            .field("leases", &tokens)
            .field("last", &self.last)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
