//! Chunk engine: split a file into chunk messages, buffer arriving fragments, reassemble.

use std::collections::BTreeMap;

use crate::config::ProtocolConfig;
use crate::file::File;
use crate::protocol::{Bitmap, ChunkId, HostId, Message, TransactionId};

/// Split a file into `chunk_count` contiguous fragments of equal length.
pub fn split_into_chunks(file: &File, chunk_count: usize) -> Vec<(ChunkId, File)> {
    if chunk_count == 0 {
        return vec![];
    }
    (0..chunk_count)
        .map(|i| (ChunkId::new(file.id(), i), fragment_of(file, i, chunk_count)))
        .collect()
}

fn fragment_of(file: &File, index: usize, chunk_count: usize) -> File {
    let len = file.data().len() / chunk_count;
    file.fragment(index * len, len)
}

/// Chunk message for one index, stamped `now + stagger * (index + 1)` so a burst
/// is ordered by index under FIFO queueing.
pub fn chunk_message(
    file: &File,
    index: usize,
    from: HostId,
    to: HostId,
    transaction: TransactionId,
    config: &ProtocolConfig,
    now: f64,
) -> Option<Message> {
    if index >= config.chunk_count {
        return None;
    }
    let at = now + config.chunk_stagger * (index as f64 + 1.0);
    Some(Message::chunk(
        from,
        to,
        transaction,
        ChunkId::new(file.id(), index),
        fragment_of(file, index, config.chunk_count),
        config.chunk_size(),
        at,
    ))
}

/// The full burst for one file, in index order.
pub fn chunk_messages(
    file: &File,
    from: HostId,
    to: HostId,
    transaction: TransactionId,
    config: &ProtocolConfig,
    now: f64,
) -> Vec<Message> {
    (0..config.chunk_count)
        .filter_map(|i| chunk_message(file, i, from, to, transaction, config, now))
        .collect()
}

/// Fragments of one file received so far, keyed by chunk index.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    filename: String,
    chunk_count: usize,
    received: BTreeMap<usize, File>,
}

impl ChunkSet {
    pub fn new(filename: impl Into<String>, chunk_count: usize) -> Self {
        Self {
            filename: filename.into(),
            chunk_count,
            received: BTreeMap::new(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Record a fragment. Out-of-range or foreign chunk ids are ignored.
    /// Returns true if the set is now complete.
    pub fn insert(&mut self, chunk_id: &ChunkId, fragment: File) -> bool {
        if chunk_id.filename == self.filename && chunk_id.index < self.chunk_count {
            self.received.insert(chunk_id.index, fragment);
        }
        self.is_complete()
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        chunk_id.filename == self.filename && self.received.contains_key(&chunk_id.index)
    }

    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        (0..self.chunk_count).all(|i| self.received.contains_key(&i))
    }

    /// Bit i set iff chunk i is held right now.
    pub fn bitmap(&self) -> Bitmap {
        let mut bitmap = Bitmap::new(self.chunk_count);
        for &i in self.received.keys() {
            bitmap.set(i);
        }
        bitmap
    }

    /// Concatenate fragments by ascending index. `None` until every chunk is present.
    pub fn reassemble(&self, now: f64) -> Option<File> {
        if !self.is_complete() {
            return None;
        }
        File::from_fragments(self.received.values(), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_file() -> File {
        File::new("filename3", HostId(2), 5000, (100..200).collect(), 0.0)
    }

    fn txn() -> TransactionId {
        TransactionId::generate(&mut StdRng::seed_from_u64(3))
    }

    #[test]
    fn split_ten_by_ten() {
        let chunks = split_into_chunks(&sample_file(), 10);
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[0].0.to_string(), "filename3Chunk0");
        assert_eq!(chunks[4].1.data(), &(140..150).collect::<Vec<u32>>()[..]);
        assert_eq!(chunks[9].1.data().len(), 10);
    }

    #[test]
    fn split_zero_count_is_empty() {
        assert!(split_into_chunks(&sample_file(), 0).is_empty());
    }

    #[test]
    fn burst_is_staggered_in_index_order() {
        let cfg = ProtocolConfig::default();
        let msgs = chunk_messages(&sample_file(), HostId(2), HostId(1), txn(), &cfg, 10.0);
        assert_eq!(msgs.len(), 10);
        for w in msgs.windows(2) {
            assert!(w[0].creation_time < w[1].creation_time);
        }
        assert!(msgs[9].creation_time < 10.0 + cfg.control_delay);
        assert!(msgs.iter().all(|m| m.size == cfg.chunk_size()));
    }

    #[test]
    fn single_chunk_regeneration_matches_burst() {
        let cfg = ProtocolConfig::default();
        let f = sample_file();
        let burst = chunk_messages(&f, HostId(2), HostId(1), txn(), &cfg, 0.0);
        let one = chunk_message(&f, 4, HostId(2), HostId(1), txn(), &cfg, 0.0).unwrap();
        assert_eq!(one.packet, burst[4].packet);
        assert_eq!(one.id, burst[4].id);
        assert!(chunk_message(&f, 10, HostId(2), HostId(1), txn(), &cfg, 0.0).is_none());
    }

    #[test]
    fn reassembly_restores_original() {
        let f = sample_file();
        let mut set = ChunkSet::new("filename3", 10);
        let mut chunks = split_into_chunks(&f, 10);
        chunks.reverse();
        let mut done = false;
        for (id, frag) in chunks {
            assert!(set.reassemble(1.0).is_none() || done);
            done = set.insert(&id, frag);
        }
        assert!(done);
        let whole = set.reassemble(7.0).unwrap();
        assert_eq!(whole.data(), f.data());
        assert_eq!(whole.time_request(), 7.0);
        assert!(!whole.is_initial());
    }

    #[test]
    fn bitmap_reflects_held_chunks() {
        let f = sample_file();
        let mut set = ChunkSet::new("filename3", 10);
        for (id, frag) in split_into_chunks(&f, 10) {
            if id.index != 4 {
                set.insert(&id, frag);
            }
        }
        assert_eq!(set.bitmap().to_string(), "[1,1,1,1,0,1,1,1,1,1]");
        assert!(!set.is_complete());
        assert!(set.contains(&ChunkId::new("filename3", 3)));
        assert!(!set.contains(&ChunkId::new("filename3", 4)));
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let f = sample_file();
        let mut set = ChunkSet::new("filename3", 10);
        let (id, frag) = split_into_chunks(&f, 10).remove(0);
        set.insert(&id, frag.clone());
        set.insert(&id, frag);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn foreign_chunk_ignored() {
        let mut set = ChunkSet::new("filename3", 10);
        let other = File::new("filename5", HostId(2), 5000, vec![0; 10], 0.0);
        set.insert(&ChunkId::new("filename5", 0), other.clone());
        set.insert(&ChunkId::new("filename3", 12), other);
        assert!(set.is_empty());
    }
}
