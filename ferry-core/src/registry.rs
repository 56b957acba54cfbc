//! Retransmission registry: pending confirmations with a tick-based lifetime and retry budget.
//!
//! Every entry is keyed by what it waits for and the transaction it belongs to. The registry
//! only counts ticks; what happens on expiry depends on host state and is decided by the core.

use std::collections::{HashMap, HashSet};

use crate::config::ProtocolConfig;
use crate::protocol::{Message, Role, TransactionId};

/// What a registry entry is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pending {
    /// A sent Request awaiting its RequestAck.
    Request,
    /// A partially received transfer; expiry abandons the buffered chunks.
    ChunkKeepAlive,
    /// A sent Control awaiting a full Ack.
    Control,
    /// A sent Ack, kept so a repeated Control can be answered.
    Ack,
    /// A sent RequestAck, kept so a repeated Request can be answered.
    RequestAck,
}

impl Pending {
    pub fn lifetime(self, config: &ProtocolConfig) -> f64 {
        match self {
            Pending::Request | Pending::Control => config.time_out,
            Pending::ChunkKeepAlive => config.time_free(),
            Pending::Ack | Pending::RequestAck => config.time_wait,
        }
    }

    pub fn budget(self, config: &ProtocolConfig) -> RetryBudget {
        match self {
            Pending::Request | Pending::Control => RetryBudget::Remaining(config.retransmit_limit),
            _ => RetryBudget::ExpireOnly,
        }
    }
}

impl From<Role> for Pending {
    fn from(role: Role) -> Self {
        match role {
            Role::Request => Pending::Request,
            Role::Chunk => Pending::ChunkKeepAlive,
            Role::Control => Pending::Control,
            Role::Ack => Pending::Ack,
            Role::RequestAck => Pending::RequestAck,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RetransmitKey {
    pub pending: Pending,
    pub transaction: TransactionId,
}

impl RetransmitKey {
    pub fn new(pending: Pending, transaction: TransactionId) -> Self {
        Self {
            pending,
            transaction,
        }
    }

    pub fn for_message(message: &Message) -> Self {
        Self::new(message.role().into(), message.transaction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    Remaining(u32),
    /// No retransmission; the entry simply expires.
    ExpireOnly,
}

#[derive(Debug, Clone)]
pub struct RetransmitEntry {
    pub message: Message,
    remaining_ticks: u64,
    budget: RetryBudget,
}

impl RetransmitEntry {
    pub fn remaining_ticks(&self) -> u64 {
        self.remaining_ticks
    }

    pub fn budget(&self) -> RetryBudget {
        self.budget
    }
}

/// Result of spending one retry on an entry.
#[derive(Debug)]
pub enum RetryOutcome {
    /// Budget decremented and lifetime re-armed; resend this snapshot.
    Retry(Message),
    /// Budget was already spent; the entry has been removed.
    Exhausted(RetransmitEntry),
    Missing,
}

#[derive(Debug, Default)]
pub struct RetransmitRegistry {
    entries: HashMap<RetransmitKey, RetransmitEntry>,
}

impl RetransmitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `message` under its role's policy, replacing any entry with the same key.
    pub fn track(&mut self, message: Message, config: &ProtocolConfig) -> RetransmitKey {
        let key = RetransmitKey::for_message(&message);
        let entry = RetransmitEntry {
            message,
            remaining_ticks: config.ticks_for(key.pending.lifetime(config)),
            budget: key.pending.budget(config),
        };
        self.entries.insert(key, entry);
        key
    }

    pub fn get(&self, key: &RetransmitKey) -> Option<&RetransmitEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &RetransmitKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &RetransmitKey) -> Option<RetransmitEntry> {
        self.entries.remove(key)
    }

    /// Re-arm an entry's lifetime without touching its budget. Returns false if absent.
    pub fn refresh(&mut self, key: &RetransmitKey, ticks: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.remaining_ticks = ticks;
                true
            }
            None => false,
        }
    }

    /// Spend one retry: decrement the budget and re-arm, or remove the entry if nothing is left.
    pub fn consume_retry(&mut self, key: &RetransmitKey, ticks: u64) -> RetryOutcome {
        let Some(entry) = self.entries.get_mut(key) else {
            return RetryOutcome::Missing;
        };
        match entry.budget {
            RetryBudget::Remaining(n) if n > 0 => {
                entry.budget = RetryBudget::Remaining(n - 1);
                entry.remaining_ticks = ticks;
                RetryOutcome::Retry(entry.message.clone())
            }
            _ => match self.entries.remove(key) {
                Some(entry) => RetryOutcome::Exhausted(entry),
                None => RetryOutcome::Missing,
            },
        }
    }

    /// Advance one tick. Returns the keys whose lifetime reached zero, in key order.
    /// Expired entries stay registered until the caller retries or removes them.
    pub fn sweep(&mut self) -> Vec<RetransmitKey> {
        let mut expired: Vec<RetransmitKey> = self
            .entries
            .iter_mut()
            .filter_map(|(key, entry)| {
                entry.remaining_ticks = entry.remaining_ticks.saturating_sub(1);
                (entry.remaining_ticks == 0).then_some(*key)
            })
            .collect();
        expired.sort();
        expired
    }

    /// Filenames with an entry of the given kind.
    pub fn filenames(&self, pending: Pending) -> HashSet<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.pending == pending)
            .map(|(_, e)| e.message.filename.as_str())
            .collect()
    }

    /// Entries belonging to one transaction.
    pub fn for_transaction(&self, transaction: TransactionId) -> Vec<RetransmitKey> {
        let mut keys: Vec<RetransmitKey> = self
            .entries
            .keys()
            .filter(|k| k.transaction == transaction)
            .copied()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
