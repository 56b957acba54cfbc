//! Per-host storage: completed files, in-progress chunk sets, the relay message index,
//! and the outgoing buffer.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::chunk::ChunkSet;
use crate::file::File;
use crate::protocol::{ChunkId, HostId, Message, Role};

/// Result of inserting a file with eviction.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    /// Filenames removed to make room, oldest first.
    pub evicted: Vec<String>,
    pub stored: bool,
}

/// File cache plus transient per-file transfer state.
#[derive(Debug)]
pub struct FileCache {
    capacity: u64,
    files: HashMap<String, File>,
    chunks: HashMap<String, ChunkSet>,
    /// Chunk messages a relay has buffered, by chunk index, for replay once the file completes.
    index: HashMap<String, BTreeMap<usize, Message>>,
}

impl FileCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            files: HashMap::new(),
            chunks: HashMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn file(&self, filename: &str) -> Option<&File> {
        self.files.get(filename)
    }

    pub fn file_mut(&mut self, filename: &str) -> Option<&mut File> {
        self.files.get_mut(filename)
    }

    pub fn contains_file(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn remove_file(&mut self, filename: &str) -> Option<File> {
        self.files.remove(filename)
    }

    pub fn occupancy(&self) -> u64 {
        self.files.values().map(File::size).sum()
    }

    /// May be negative only if capacity was lowered under existing content.
    pub fn free_space(&self) -> i64 {
        self.capacity as i64 - self.occupancy() as i64
    }

    /// Evict unpinned files, oldest request time first, until `needed` bytes are free.
    /// Returns the evicted names, or `None` if enough room cannot be made; in that case
    /// nothing is evicted.
    pub fn make_room(&mut self, needed: u64, pinned: &HashSet<&str>) -> Option<Vec<String>> {
        let mut free = self.free_space();
        if free >= needed as i64 {
            return Some(vec![]);
        }
        let mut candidates: Vec<(&str, f64, u64)> = self
            .files
            .values()
            .filter(|f| !pinned.contains(f.id()))
            .map(|f| (f.id(), f.time_request(), f.size()))
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        let mut victims = Vec::new();
        for (name, _, size) in candidates {
            if free >= needed as i64 {
                break;
            }
            free += size as i64;
            victims.push(name.to_string());
        }
        if free < needed as i64 {
            return None;
        }
        for name in &victims {
            self.files.remove(name);
        }
        Some(victims)
    }

    /// Insert `file`, evicting first if it would not fit. A file that cannot fit is not stored.
    pub fn store_file(&mut self, file: File, pinned: &HashSet<&str>) -> StoreOutcome {
        let replaced = self.files.remove(file.id());
        match self.make_room(file.size(), pinned) {
            Some(evicted) => {
                self.files.insert(file.id().to_string(), file);
                StoreOutcome {
                    evicted,
                    stored: true,
                }
            }
            None => {
                if let Some(old) = replaced {
                    self.files.insert(old.id().to_string(), old);
                }
                StoreOutcome::default()
            }
        }
    }

    /// Buffer one fragment. Returns true once every chunk of the file is present.
    pub fn insert_chunk(&mut self, chunk_id: &ChunkId, fragment: File, chunk_count: usize) -> bool {
        self.chunks
            .entry(chunk_id.filename.clone())
            .or_insert_with(|| ChunkSet::new(chunk_id.filename.clone(), chunk_count))
            .insert(chunk_id, fragment)
    }

    pub fn chunk_set(&self, filename: &str) -> Option<&ChunkSet> {
        self.chunks.get(filename)
    }

    pub fn remove_chunks(&mut self, filename: &str) -> Option<ChunkSet> {
        self.chunks.remove(filename)
    }

    pub fn index_chunk(&mut self, index: usize, message: Message) {
        self.index
            .entry(message.filename.clone())
            .or_default()
            .insert(index, message);
    }

    pub fn indexed(&self, filename: &str) -> Option<&BTreeMap<usize, Message>> {
        self.index.get(filename)
    }

    pub fn take_index(&mut self, filename: &str) -> BTreeMap<usize, Message> {
        self.index.remove(filename).unwrap_or_default()
    }
}

/// Admission result for a message offered to a host. Not an error: the caller decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// The host already carries a message with this id.
    DeniedOld,
    DeniedNoSpace,
    DeniedTtl,
    /// The host is already on the message's hop path.
    DeniedPolicy,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        self == Admission::Accepted
    }
}

/// Messages held for transfer, keyed by id.
#[derive(Debug, Default)]
pub struct Outbox {
    capacity: Option<u64>,
    messages: HashMap<String, Message>,
}

impl Outbox {
    pub fn new(capacity: Option<u64>) -> Self {
        Self {
            capacity,
            messages: HashMap::new(),
        }
    }

    /// Insert or replace by id. Local messages are never refused, so free space can go negative.
    pub fn insert(&mut self, message: Message) {
        self.messages.insert(message.id.clone(), message);
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        self.messages.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn used(&self) -> u64 {
        self.messages.values().map(|m| m.size).sum()
    }

    /// `None` when unbounded.
    pub fn free_space(&self) -> Option<i64> {
        self.capacity.map(|c| c as i64 - self.used() as i64)
    }

    pub fn has_room_for(&self, size: u64) -> bool {
        self.free_space().map_or(true, |free| free >= size as i64)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Filenames with a Chunk still waiting to leave this host.
    pub fn chunk_filenames(&self) -> HashSet<&str> {
        self.messages
            .values()
            .filter(|m| m.role() == Role::Chunk)
            .map(|m| m.filename.as_str())
            .collect()
    }

    pub fn addressed_to(&self, host: HostId) -> impl Iterator<Item = &Message> {
        self.messages.values().filter(move |m| m.to == host)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
