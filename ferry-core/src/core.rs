//! Host-driven API: FerryCore is told about completed transfers and ticks, and leaves
//! every message it wants sent in its outgoing buffer for the host to pick up.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::cache::{Admission, FileCache, Outbox};
use crate::chunk;
use crate::config::{ConfigError, ProtocolConfig};
use crate::file::File;
use crate::protocol::{Bitmap, HostId, Message, Packet, Role, TransactionId};
use crate::registry::{Pending, RetransmitKey, RetransmitRegistry, RetryOutcome};
use crate::scheduler;

/// What happened to a message handed to [`FerryCore::on_message_transferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Kept in the outgoing buffer for further forwarding.
    Forwarded,
    /// Handled here and not forwarded.
    Consumed,
    /// Completed a file at this host.
    Reassembled,
}

/// Per-node counters for reporting.
#[derive(Debug, Default, Clone, Serialize)]
pub struct NodeStats {
    pub requests_created: u64,
    pub retransmissions: u64,
    pub chunks_regenerated: u64,
    pub files_reassembled: u64,
    pub evictions: u64,
    pub abandoned: u64,
}

/// One host's protocol state. The host passes events; the core fills the outgoing buffer.
pub struct FerryCore {
    host: HostId,
    config: ProtocolConfig,
    cache: FileCache,
    outbox: Outbox,
    registry: RetransmitRegistry,
    rng: StdRng,
    delivered: HashSet<String>,
    stats: NodeStats,
}

impl FerryCore {
    /// Node seeded from its host id.
    pub fn new(host: HostId, config: ProtocolConfig) -> Result<Self, ConfigError> {
        Self::with_seed(host, config, u64::from(host.0))
    }

    pub fn with_seed(host: HostId, config: ProtocolConfig, seed: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            host,
            cache: FileCache::new(config.file_buffer_size),
            outbox: Outbox::new(config.buffer_size),
            registry: RetransmitRegistry::new(),
            rng: StdRng::seed_from_u64(seed),
            delivered: HashSet::new(),
            stats: NodeStats::default(),
            config,
        })
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    pub fn registry(&self) -> &RetransmitRegistry {
        &self.registry
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn has_file(&self, filename: &str) -> bool {
        self.cache.contains_file(filename)
    }

    pub fn file(&self, filename: &str) -> Option<&File> {
        self.cache.file(filename)
    }

    /// Number of distinct messages delivered here as final recipient.
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Place an origin copy of a file at this host.
    pub fn place_file(&mut self, file: File) -> Result<(), DispatchError> {
        let expected = self.config.data_len();
        if file.data().len() != expected {
            return Err(DispatchError::InvalidFile {
                filename: file.id().to_string(),
                len: file.data().len(),
                expected,
            });
        }
        let filename = file.id().to_string();
        let outcome = self
            .cache
            .store_file(file, &pinned_files(&self.registry, &self.outbox));
        self.stats.evictions += outcome.evicted.len() as u64;
        if !outcome.stored {
            return Err(DispatchError::CacheFull { filename });
        }
        debug!(host = %self.host, %filename, "file placed");
        Ok(())
    }

    /// Ask `holder` for `filename`. Returns the new transaction id, or `None` when the
    /// file is already cached here or this host is the holder.
    pub fn create_request(
        &mut self,
        filename: &str,
        holder: HostId,
        now: f64,
    ) -> Option<TransactionId> {
        if holder == self.host || self.cache.contains_file(filename) {
            return None;
        }
        let txn = TransactionId::generate(&mut self.rng);
        let request = Message::request(
            self.host,
            holder,
            filename,
            txn,
            self.config.request_size,
            self.config.file_size,
            now,
        );
        self.registry.track(request.clone(), &self.config);
        self.enqueue(request);
        self.stats.requests_created += 1;
        debug!(host = %self.host, %filename, %holder, %txn, "request created");
        Some(txn)
    }

    /// Admission check before a transfer from `from` starts. Does not change state.
    pub fn receive_message(&self, msg: &Message, from: HostId, now: f64) -> Admission {
        let admission = if msg.is_expired(now) {
            Admission::DeniedTtl
        } else if msg.to == self.host {
            Admission::Accepted
        } else if self.outbox.contains(&msg.id) {
            Admission::DeniedOld
        } else if msg.hops.contains(&self.host) {
            Admission::DeniedPolicy
        } else if !self.outbox.has_room_for(msg.size) {
            Admission::DeniedNoSpace
        } else {
            Admission::Accepted
        };
        if !admission.is_accepted() {
            debug!(host = %self.host, %from, id = %msg.id, ?admission, "message refused");
        }
        admission
    }

    /// A message finished transferring into this host from `from`.
    pub fn on_message_transferred(
        &mut self,
        mut msg: Message,
        from: HostId,
        now: f64,
    ) -> Result<Disposition, DispatchError> {
        msg.receive_time = now;
        if msg.hops.last() != Some(&self.host) {
            msg.hops.push(self.host);
        }
        let is_final = msg.to == self.host;
        if is_final {
            self.delivered.insert(msg.id.clone());
        }
        trace!(
            host = %self.host,
            %from,
            id = %msg.id,
            role = ?msg.role(),
            txn = %msg.transaction,
            is_final,
            "dispatch"
        );
        let disposition = match msg.role() {
            Role::Request => self.on_request(&msg, from, is_final, now)?,
            Role::Chunk => self.on_chunk(&msg),
            Role::Control => self.on_control(&msg, from, is_final, now),
            Role::Ack => self.on_ack(&msg, is_final, now),
            Role::RequestAck => self.on_request_ack(&msg, is_final),
        };
        if disposition == Disposition::Forwarded {
            self.enqueue(msg);
        }
        Ok(disposition)
    }

    /// One registry sweep; call every `tick_interval` of simulated time.
    pub fn tick(&mut self, now: f64) {
        for key in self.registry.sweep() {
            match key.pending {
                Pending::Request => self.expire_request(&key, now),
                Pending::Control => self.expire_control(&key, now),
                Pending::ChunkKeepAlive => self.expire_keep_alive(&key),
                Pending::Ack | Pending::RequestAck => {
                    self.registry.remove(&key);
                }
            }
        }
    }

    /// Buffered messages in send order.
    pub fn outgoing(&mut self) -> Vec<Message> {
        let messages = self.outbox.iter().cloned().collect();
        scheduler::order_by_queue_mode(messages, self.config.queue_mode, &mut self.rng)
    }

    /// Buffered messages addressed to `next_hop`, in send order.
    pub fn outgoing_for(&mut self, next_hop: HostId) -> Vec<Message> {
        let messages = self.outbox.addressed_to(next_hop).cloned().collect();
        scheduler::order_by_queue_mode(messages, self.config.queue_mode, &mut self.rng)
    }

    /// Remove a message from the outgoing buffer as its transfer starts.
    pub fn take_outgoing(&mut self, id: &str) -> Option<Message> {
        self.outbox.remove(id)
    }

    fn on_request(
        &mut self,
        msg: &Message,
        from: HostId,
        is_final: bool,
        now: f64,
    ) -> Result<Disposition, DispatchError> {
        let holds = self.cache.contains_file(&msg.filename);
        let rack_key = RetransmitKey::new(Pending::RequestAck, msg.transaction);
        if self.registry.contains(&rack_key) {
            self.resend_registered(&rack_key, self.config.time_wait, now);
            debug!(host = %self.host, txn = %msg.transaction, "duplicate request, request-ack resent");
            return Ok(if is_final || holds {
                Disposition::Consumed
            } else {
                Disposition::Forwarded
            });
        }
        if is_final && !holds {
            return Err(DispatchError::FileNotHeld {
                host: self.host,
                filename: msg.filename.clone(),
            });
        }
        let rack = Message::request_ack(
            self.host,
            from,
            &msg.filename,
            msg.transaction,
            self.config.control_size,
            now,
        );
        self.registry.track(rack.clone(), &self.config);
        self.enqueue(rack);

        let Some(file) = self.cache.file_mut(&msg.filename) else {
            return Ok(Disposition::Forwarded);
        };
        file.set_time_request(now);
        let file = file.clone();
        self.serve(&file, msg.from, msg.transaction, now);
        self.outbox.remove(&msg.id);
        Ok(Disposition::Consumed)
    }

    fn on_chunk(&mut self, msg: &Message) -> Disposition {
        let Packet::Chunk { chunk_id, fragment } = &msg.packet else {
            return Disposition::Consumed;
        };
        let key = RetransmitKey::new(Pending::ChunkKeepAlive, msg.transaction);
        let ticks = self.config.ticks_for(self.config.time_free());
        if !self.registry.refresh(&key, ticks) {
            self.registry.track(msg.clone(), &self.config);
        }
        if self.cache.contains_file(&msg.filename) {
            trace!(host = %self.host, %chunk_id, "chunk for cached file discarded");
            return Disposition::Consumed;
        }
        self.cache
            .insert_chunk(chunk_id, fragment.clone(), self.config.chunk_count);
        self.cache.index_chunk(chunk_id.index, msg.clone());
        trace!(host = %self.host, %chunk_id, "chunk buffered");
        Disposition::Consumed
    }

    fn on_control(&mut self, msg: &Message, from: HostId, is_final: bool, now: f64) -> Disposition {
        if self.cache.contains_file(&msg.filename) {
            trace!(host = %self.host, filename = %msg.filename, "stale control");
            return Disposition::Consumed;
        }
        let bitmap = match self.cache.chunk_set(&msg.filename) {
            Some(set) => set.bitmap(),
            None => Bitmap::new(self.config.chunk_count),
        };
        if bitmap.count() == 0 {
            // A registered Ack may describe chunks purged since it was sent.
            let ack_key = RetransmitKey::new(Pending::Ack, msg.transaction);
            let current = self
                .registry
                .get(&ack_key)
                .is_some_and(|e| e.message.packet == Packet::Ack { bitmap });
            if !current || !self.resend_registered(&ack_key, self.config.time_wait, now) {
                self.send_ack(msg, from, bitmap, now);
            }
            return Disposition::Consumed;
        }
        if !bitmap.is_full() {
            debug!(host = %self.host, filename = %msg.filename, %bitmap, "partial transfer acked");
            self.send_ack(msg, from, bitmap, now);
            return Disposition::Consumed;
        }
        self.complete_transfer(msg, from, is_final, now)
    }

    fn complete_transfer(
        &mut self,
        msg: &Message,
        from: HostId,
        is_final: bool,
        now: f64,
    ) -> Disposition {
        let Some(file) = self
            .cache
            .remove_chunks(&msg.filename)
            .and_then(|set| set.reassemble(now))
        else {
            return Disposition::Consumed;
        };
        self.registry
            .remove(&RetransmitKey::new(Pending::ChunkKeepAlive, msg.transaction));
        let indexed = self.cache.take_index(&msg.filename);

        let outcome = self
            .cache
            .store_file(file, &pinned_files(&self.registry, &self.outbox));
        if !outcome.evicted.is_empty() {
            info!(host = %self.host, evicted = ?outcome.evicted, "cache eviction");
            self.stats.evictions += outcome.evicted.len() as u64;
        }
        if !outcome.stored {
            // Nothing is held any more: an empty Ack keeps the sender's Control retrying.
            warn!(host = %self.host, filename = %msg.filename, "no room for reassembled file");
            self.send_ack(msg, from, Bitmap::new(self.config.chunk_count), now);
            return Disposition::Consumed;
        }
        info!(host = %self.host, filename = %msg.filename, txn = %msg.transaction, "file reassembled");
        self.stats.files_reassembled += 1;

        if !is_final {
            for (i, chunk) in indexed {
                let at = now + self.config.chunk_stagger * (i as f64 + 1.0);
                self.enqueue(chunk.resent_from(self.host, at));
            }
            let control = msg.resent_from(self.host, now + self.config.control_delay);
            self.registry.track(control.clone(), &self.config);
            self.enqueue(control);
            debug!(host = %self.host, to = %msg.to, "relaying transfer");
        }
        self.send_ack(msg, from, Bitmap::full(self.config.chunk_count), now);
        Disposition::Reassembled
    }

    fn on_ack(&mut self, msg: &Message, is_final: bool, now: f64) -> Disposition {
        if !is_final {
            return Disposition::Forwarded;
        }
        let Packet::Ack { bitmap } = &msg.packet else {
            return Disposition::Consumed;
        };
        let bitmap = *bitmap;
        let key = RetransmitKey::new(Pending::Control, msg.transaction);
        if bitmap.is_full() {
            if self.registry.remove(&key).is_some() {
                debug!(host = %self.host, txn = %msg.transaction, "transfer confirmed");
            }
            return Disposition::Consumed;
        }
        let Some(file) = self.cache.file(&msg.filename).cloned() else {
            if self.registry.remove(&key).is_some() {
                self.stats.abandoned += 1;
                warn!(host = %self.host, filename = %msg.filename, "file evicted mid-transfer");
            }
            return Disposition::Consumed;
        };
        match self
            .registry
            .consume_retry(&key, self.config.ticks_for(self.config.time_out))
        {
            RetryOutcome::Retry(control) => {
                for i in bitmap.missing() {
                    if let Some(chunk) = chunk::chunk_message(
                        &file,
                        i,
                        self.host,
                        control.to,
                        msg.transaction,
                        &self.config,
                        now,
                    ) {
                        self.enqueue(chunk);
                        self.stats.chunks_regenerated += 1;
                    }
                }
                self.enqueue(control.resent_from(self.host, now + self.config.control_delay));
                self.stats.retransmissions += 1;
                debug!(host = %self.host, %bitmap, txn = %msg.transaction, "missing chunks regenerated");
            }
            RetryOutcome::Exhausted(_) => {
                self.stats.abandoned += 1;
                warn!(host = %self.host, txn = %msg.transaction, "control retries exhausted");
            }
            RetryOutcome::Missing => {
                trace!(host = %self.host, txn = %msg.transaction, "ack for unknown transaction");
            }
        }
        Disposition::Consumed
    }

    fn on_request_ack(&mut self, msg: &Message, is_final: bool) -> Disposition {
        if !is_final {
            return Disposition::Forwarded;
        }
        self.registry
            .remove(&RetransmitKey::new(Pending::Request, msg.transaction));
        Disposition::Consumed
    }

    fn expire_request(&mut self, key: &RetransmitKey, now: f64) {
        let cached = self
            .registry
            .get(key)
            .map(|e| self.cache.contains_file(&e.message.filename));
        match cached {
            Some(true) => {
                self.registry.remove(key);
            }
            Some(false) => self.retry(key, now),
            None => {}
        }
    }

    fn expire_control(&mut self, key: &RetransmitKey, now: f64) {
        let held = self
            .registry
            .get(key)
            .map(|e| self.cache.contains_file(&e.message.filename));
        match held {
            Some(true) => self.retry(key, now),
            Some(false) => {
                self.registry.remove(key);
                self.stats.abandoned += 1;
            }
            None => {}
        }
    }

    fn expire_keep_alive(&mut self, key: &RetransmitKey) {
        let Some(entry) = self.registry.remove(key) else {
            return;
        };
        self.registry
            .remove(&RetransmitKey::new(Pending::Ack, key.transaction));
        let filename = &entry.message.filename;
        self.cache.take_index(filename);
        if self.cache.remove_chunks(filename).is_some() {
            self.stats.abandoned += 1;
            debug!(host = %self.host, %filename, "partial transfer abandoned");
        }
    }

    fn retry(&mut self, key: &RetransmitKey, now: f64) {
        let ticks = self.config.ticks_for(key.pending.lifetime(&self.config));
        match self.registry.consume_retry(key, ticks) {
            RetryOutcome::Retry(msg) => {
                self.stats.retransmissions += 1;
                debug!(host = %self.host, id = %msg.id, "retransmit");
                self.enqueue(msg.resent_from(self.host, now));
            }
            RetryOutcome::Exhausted(entry) => {
                self.stats.abandoned += 1;
                warn!(host = %self.host, id = %entry.message.id, "retries exhausted");
            }
            RetryOutcome::Missing => {}
        }
    }

    /// Re-arm a registered confirmation and send it again. False if nothing is registered.
    fn resend_registered(&mut self, key: &RetransmitKey, lifetime: f64, now: f64) -> bool {
        let ticks = self.config.ticks_for(lifetime);
        if !self.registry.refresh(key, ticks) {
            return false;
        }
        let Some(resend) = self
            .registry
            .get(key)
            .map(|e| e.message.resent_from(self.host, now))
        else {
            return false;
        };
        self.enqueue(resend);
        true
    }

    fn send_ack(&mut self, msg: &Message, to: HostId, bitmap: Bitmap, now: f64) {
        let ack = Message::ack(
            self.host,
            to,
            &msg.filename,
            msg.transaction,
            bitmap,
            self.config.control_size,
            now,
        );
        self.registry.track(ack.clone(), &self.config);
        self.enqueue(ack);
    }

    /// Send the whole chunk burst and its Control to `to`.
    fn serve(&mut self, file: &File, to: HostId, transaction: TransactionId, now: f64) {
        for chunk in chunk::chunk_messages(file, self.host, to, transaction, &self.config, now) {
            self.enqueue(chunk);
        }
        let control = Message::control(
            self.host,
            to,
            file.id(),
            transaction,
            self.config.control_size,
            now + self.config.control_delay,
        );
        self.registry.track(control.clone(), &self.config);
        self.enqueue(control);
        debug!(host = %self.host, filename = %file.id(), %to, txn = %transaction, "serving file");
    }

    fn enqueue(&mut self, mut msg: Message) {
        if msg.ttl.is_none() {
            msg.ttl = self.config.msg_ttl;
        }
        self.outbox.insert(msg);
    }
}

/// Files that must stay cached: a Control is pending or chunks are still queued.
fn pinned_files<'a>(registry: &'a RetransmitRegistry, outbox: &'a Outbox) -> HashSet<&'a str> {
    let mut pinned = registry.filenames(Pending::Control);
    pinned.extend(outbox.chunk_filenames());
    pinned
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{host} is the final recipient of a request for {filename} but does not hold it")]
    FileNotHeld { host: HostId, filename: String },
    #[error("file {filename} has {len} data elements, expected {expected}")]
    InvalidFile {
        filename: String,
        len: usize,
        expected: usize,
    },
    #[error("no room to cache {filename}")]
    CacheFull { filename: String },
}
