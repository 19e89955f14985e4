//! Ordered, conditional callback chains.

use super::{Callback, CallbackEvent};

/// An ordered list of callbacks executed one after another.
///
/// Entries run in descending priority; entries with equal priority keep their
/// insertion order. Each entry has its own panic boundary and condition, so a
/// failing or skipped entry never stops the ones after it.
#[derive(Debug, Clone, Default)]
pub struct CallbackChain {
    entries: Vec<Callback>,
}

impl CallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback and return the chain.
    pub fn then(mut self, callback: Callback) -> Self {
        self.push(callback);
        self
    }

    pub fn push(&mut self, callback: Callback) {
        // Insert after every entry with priority >= the new one.
        let position = self
            .entries
            .partition_point(|existing| existing.priority >= callback.priority);
        self.entries.insert(position, callback);
    }

    /// Remove an entry by id.
    pub fn remove(&mut self, callback_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|cb| cb.id() != callback_id);
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[Callback] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that react to `event`, in execution order.
    pub(crate) fn matching<'a>(
        &'a self,
        event: &'a CallbackEvent,
    ) -> impl Iterator<Item = &'a Callback> + 'a {
        self.entries.iter().filter(move |cb| cb.handles(event))
    }
}

impl FromIterator<Callback> for CallbackChain {
    fn from_iter<I: IntoIterator<Item = Callback>>(iter: I) -> Self {
        let mut chain = Self::new();
        for callback in iter {
            chain.push(callback);
        }
        chain
    }
}
