//! Message chain: the per-session queue, history, reacted ledger and
//! scoped variable store

use crate::identity::{ChainId, ListenerId, MsgId};
use crate::message::{GameMessage, Phase};
use crate::value::Value;
use indexmap::IndexMap;
use std::cell::Cell;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// The per-session event queue plus its bookkeeping
///
/// Immediate messages enter at the front of the queue (processed next),
/// deferred messages at the back. Resolved messages are appended to the
/// history, which doubles as the lookup table for check-body
/// synchronization between phase siblings.
#[derive(Debug)]
pub struct MessageChain {
    id: ChainId,
    queue: VecDeque<GameMessage>,
    history: Vec<GameMessage>,
    reacted: IndexMap<ListenerId, u32>,
    variables: IndexMap<String, IndexMap<String, Value>>,
    next_msg: Cell<u64>,
}

impl MessageChain {
    /// Create a new empty chain with a fresh identity
    pub fn new() -> Self {
        Self {
            id: ChainId::next(),
            queue: VecDeque::new(),
            history: Vec::new(),
            reacted: IndexMap::new(),
            variables: IndexMap::new(),
            next_msg: Cell::new(0),
        }
    }

    /// This chain's identity
    pub fn id(&self) -> ChainId {
        self.id
    }

    /// Allocate the next message ID on this chain
    pub fn next_msg_id(&self) -> MsgId {
        let n = self.next_msg.get();
        self.next_msg.set(n + 1);
        MsgId(n)
    }

    /// Accept an immediate message at the front of the queue
    ///
    /// Unsplit messages are decomposed first; front insertion pushes POST,
    /// then MAIN, then PRE, so the phases still execute in PRE, MAIN, POST
    /// order.
    pub fn accept(&mut self, msg: GameMessage) {
        if msg.phase == Phase::Unsplit {
            let (pre, main, post) = msg.split_parts(self);
            self.queue.push_front(post);
            self.queue.push_front(main);
            self.queue.push_front(pre);
        } else {
            self.queue.push_front(msg);
        }
    }

    /// Accept a deferred message at the back of the queue
    pub fn accept_deferred(&mut self, msg: GameMessage) {
        if msg.phase == Phase::Unsplit {
            let (pre, main, post) = msg.split_parts(self);
            self.queue.push_back(pre);
            self.queue.push_back(main);
            self.queue.push_back(post);
        } else {
            self.queue.push_back(msg);
        }
    }

    /// Remove and return the front message
    pub fn pop(&mut self) -> Option<GameMessage> {
        self.queue.pop_front()
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Check whether any pending message has this kind
    pub fn contains_type(&self, kind: &str) -> bool {
        self.queue.iter().any(|m| m.kind.as_str() == kind)
    }

    /// Find the `th`-th pending message with this kind and phase (1-based)
    pub fn find_message(&self, kind: &str, phase: Phase, th: usize) -> Option<&GameMessage> {
        self.queue
            .iter()
            .filter(|m| m.kind.as_str() == kind && m.phase == phase)
            .nth(th.saturating_sub(1))
    }

    /// Drop all pending messages, keeping history, ledger and variables
    pub fn clear(&mut self) {
        self.queue.clear();
        debug!(chain = %self.id, "queue cleared");
    }

    /// Reset queue, history, reacted ledger and variables
    pub fn reset(&mut self) {
        self.queue.clear();
        self.history.clear();
        self.reacted.clear();
        self.variables.clear();
        debug!(chain = %self.id, "chain reset");
    }

    // --- history -----------------------------------------------------------

    /// Append a resolved message to the history
    pub(crate) fn record(&mut self, msg: GameMessage) {
        self.history.push(msg);
    }

    /// All resolved messages, oldest first
    pub fn history(&self) -> &[GameMessage] {
        &self.history
    }

    /// Number of messages resolved since the last reset
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Find the `th`-th resolved message with this kind (1-based)
    pub fn find_resolved(&self, kind: &str, th: usize) -> Option<&GameMessage> {
        self.history
            .iter()
            .filter(|m| m.kind.as_str() == kind)
            .nth(th.saturating_sub(1))
    }

    /// Look up a resolved message by ID, newest first
    pub fn resolved_by_id(&self, id: MsgId) -> Option<&GameMessage> {
        self.history.iter().rev().find(|m| m.id == id)
    }

    // --- reacted ledger ----------------------------------------------------

    /// Count one reaction for a listener
    pub fn update_reacted(&mut self, listener: ListenerId) {
        *self.reacted.entry(listener).or_insert(0) += 1;
    }

    /// Whether a listener has reacted at all this chain
    pub fn is_reacted(&self, listener: ListenerId) -> bool {
        self.reacted.contains_key(&listener)
    }

    /// How many times a listener has reacted this chain
    pub fn reacted_count(&self, listener: ListenerId) -> u32 {
        self.reacted.get(&listener).copied().unwrap_or(0)
    }

    // --- scoped variables --------------------------------------------------

    /// Add or update a chain variable under a scope signature
    ///
    /// Scopes keep independently-authored skills from colliding on key
    /// names; use the skill's own name as the signature.
    pub fn vadd(&mut self, sign: &str, key: &str, value: impl Into<Value>) {
        let value = value.into();
        trace!(chain = %self.id, sign, key, %value, "chain variable set");
        self.variables
            .entry(sign.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Read a chain variable without consuming it
    pub fn vget(&self, sign: &str, key: &str) -> Option<&Value> {
        self.variables.get(sign)?.get(key)
    }

    /// Consume a chain variable: the value is returned exactly once
    ///
    /// Prefer this over [`MessageChain::vget`] for values that must only
    /// apply once (one-shot multipliers and the like).
    pub fn vpop(&mut self, sign: &str, key: &str) -> Option<Value> {
        self.variables.get_mut(sign)?.shift_remove(key)
    }

    /// Whether a chain variable exists
    pub fn vhas(&self, sign: &str, key: &str) -> bool {
        self.variables
            .get(sign)
            .is_some_and(|scope| scope.contains_key(key))
    }

    /// Clear one scope, or every scope when `sign` is `None`
    pub fn vclr(&mut self, sign: Option<&str>) {
        match sign {
            Some(sign) => {
                if let Some(scope) = self.variables.get_mut(sign) {
                    scope.clear();
                }
            }
            None => self.variables.clear(),
        }
    }
}

impl Default for MessageChain {
    fn default() -> Self {
        Self::new()
    }
}
