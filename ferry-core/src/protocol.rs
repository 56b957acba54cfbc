//! Transfer protocol messages: a common envelope and one variant per message role.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::file::File;

/// Address of a host in the contact network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub u32);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Join key shared by every message of one logical transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Draw a transaction id from the caller's (seeded) RNG so runs are reproducible.
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        TransactionId(uuid::Builder::from_random_bytes(rng.gen()).into_uuid())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Chunk identifier, rendered on the wire as `<filename>Chunk<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub filename: String,
    pub index: usize,
}

impl ChunkId {
    pub fn new(filename: impl Into<String>, index: usize) -> Self {
        Self {
            filename: filename.into(),
            index,
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Chunk{}", self.filename, self.index)
    }
}

/// Presence vector over the chunk indices of one file. Bit i set = chunk i held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    bits: u64,
    len: u8,
}

impl Bitmap {
    /// All-zero bitmap over `len` chunks (`len` <= 64).
    pub fn new(len: usize) -> Self {
        Self {
            bits: 0,
            len: len.min(64) as u8,
        }
    }

    pub fn full(len: usize) -> Self {
        let mut b = Self::new(len);
        for i in 0..b.len() {
            b.set(i);
        }
        b
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len() {
            self.bits |= 1u64 << index;
        }
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len() && self.bits & (1u64 << index) != 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bits below `len`. Bits above `len` from a decoded bitmap are ignored.
    pub fn count(&self) -> usize {
        (self.bits & self.mask()).count_ones() as usize
    }

    fn mask(&self) -> u64 {
        match self.len {
            64 => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.len()
    }

    /// Indices whose bit is clear, ascending.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| !self.get(i)).collect()
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for i in 0..self.len() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", u8::from(self.get(i)))?;
        }
        write!(f, "]")
    }
}

/// Message role without payload; used for logging and registry keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Request,
    Chunk,
    Control,
    Ack,
    RequestAck,
}

/// Role-specific payload. Filename and transaction live on the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// Ask the addressed host for a file.
    Request,
    /// One fragment of the requested file.
    Chunk { chunk_id: ChunkId, fragment: File },
    /// All chunks of the transaction have been sent.
    Control,
    /// Which chunks the Control's receiver holds.
    Ack { bitmap: Bitmap },
    /// The Request arrived; stop retransmitting it.
    RequestAck,
}

impl Packet {
    pub fn role(&self) -> Role {
        match self {
            Packet::Request => Role::Request,
            Packet::Chunk { .. } => Role::Chunk,
            Packet::Control => Role::Control,
            Packet::Ack { .. } => Role::Ack,
            Packet::RequestAck => Role::RequestAck,
        }
    }
}

/// Message envelope: the logical wire contract shared by every role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: HostId,
    pub to: HostId,
    pub size: u64,
    pub response_size: u64,
    pub filename: String,
    pub transaction: TransactionId,
    pub packet: Packet,
    pub creation_time: f64,
    pub receive_time: f64,
    pub hops: Vec<HostId>,
    pub ttl: Option<f64>,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    fn envelope(
        id: String,
        from: HostId,
        to: HostId,
        filename: &str,
        transaction: TransactionId,
        packet: Packet,
        size: u64,
        now: f64,
    ) -> Self {
        Self {
            id,
            from,
            to,
            size,
            response_size: 0,
            filename: filename.to_string(),
            transaction,
            packet,
            creation_time: now,
            receive_time: now,
            hops: vec![from],
            ttl: None,
        }
    }

    pub fn request(
        from: HostId,
        to: HostId,
        filename: &str,
        transaction: TransactionId,
        size: u64,
        response_size: u64,
        now: f64,
    ) -> Self {
        let mut m = Self::envelope(
            format!("req-{transaction}"),
            from,
            to,
            filename,
            transaction,
            Packet::Request,
            size,
            now,
        );
        m.response_size = response_size;
        m
    }

    pub fn chunk(
        from: HostId,
        to: HostId,
        transaction: TransactionId,
        chunk_id: ChunkId,
        fragment: File,
        size: u64,
        now: f64,
    ) -> Self {
        let filename = chunk_id.filename.clone();
        Self::envelope(
            format!("chunk-{transaction}-{}", chunk_id.index),
            from,
            to,
            &filename,
            transaction,
            Packet::Chunk { chunk_id, fragment },
            size,
            now,
        )
    }

    pub fn control(
        from: HostId,
        to: HostId,
        filename: &str,
        transaction: TransactionId,
        size: u64,
        now: f64,
    ) -> Self {
        Self::envelope(
            format!("ctl-{transaction}"),
            from,
            to,
            filename,
            transaction,
            Packet::Control,
            size,
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn ack(
        from: HostId,
        to: HostId,
        filename: &str,
        transaction: TransactionId,
        bitmap: Bitmap,
        size: u64,
        now: f64,
    ) -> Self {
        Self::envelope(
            format!("ack-{transaction}"),
            from,
            to,
            filename,
            transaction,
            Packet::Ack { bitmap },
            size,
            now,
        )
    }

    pub fn request_ack(
        from: HostId,
        to: HostId,
        filename: &str,
        transaction: TransactionId,
        size: u64,
        now: f64,
    ) -> Self {
        Self::envelope(
            format!("rack-{transaction}"),
            from,
            to,
            filename,
            transaction,
            Packet::RequestAck,
            size,
            now,
        )
    }

    pub fn role(&self) -> Role {
        self.packet.role()
    }

    pub fn set_time(&mut self, creation: f64, receive: f64) {
        self.creation_time = creation;
        self.receive_time = receive;
    }

    /// Copy re-sent from `host` as a fresh message stamped at `at`.
    pub fn resent_from(&self, host: HostId, at: f64) -> Message {
        let mut m = self.clone();
        m.from = host;
        m.hops = vec![host];
        m.set_time(at, at);
        m
    }

    pub fn is_expired(&self, now: f64) -> bool {
        self.ttl
            .map(|ttl| now - self.creation_time > ttl)
            .unwrap_or(false)
    }
}
