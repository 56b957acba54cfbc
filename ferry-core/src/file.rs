//! File content model: an immutable data vector plus cache metadata.

use serde::{Deserialize, Serialize};

use crate::integrity;
use crate::protocol::HostId;

/// A cached file or, when carried by a Chunk, one contiguous fragment of it.
///
/// The data vector never changes after creation; only the request timestamp is refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    id: String,
    owner: HostId,
    size: u64,
    data: Vec<u32>,
    time_request: f64,
    /// True for the copy placed at the origin host; false for copies produced by reassembly.
    initial: bool,
}

impl File {
    /// Origin placement of a file at `owner`.
    pub fn new(id: impl Into<String>, owner: HostId, size: u64, data: Vec<u32>, now: f64) -> Self {
        Self {
            id: id.into(),
            owner,
            size,
            data,
            time_request: now,
            initial: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> HostId {
        self.owner
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }

    pub fn time_request(&self) -> f64 {
        self.time_request
    }

    pub fn set_time_request(&mut self, now: f64) {
        self.time_request = now;
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub fn digest(&self) -> [u8; 32] {
        integrity::digest(&self.data)
    }

    /// Copy of this file's metadata holding only `data[start..start + len]`.
    pub(crate) fn fragment(&self, start: usize, len: usize) -> File {
        let end = (start + len).min(self.data.len());
        let start = start.min(end);
        File {
            id: self.id.clone(),
            owner: self.owner,
            size: self.size,
            data: self.data[start..end].to_vec(),
            time_request: self.time_request,
            initial: self.initial,
        }
    }

    /// Build a whole file from fragments already sorted by chunk index.
    pub(crate) fn from_fragments<'a>(
        mut fragments: impl Iterator<Item = &'a File>,
        now: f64,
    ) -> Option<File> {
        let first = fragments.next()?;
        let mut file = first.clone();
        for f in fragments {
            file.data.extend_from_slice(&f.data);
        }
        file.initial = false;
        file.time_request = now;
        Some(file)
    }
}
