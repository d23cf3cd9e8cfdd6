//! The managed packet session: pipelined send/receive stages, per-type
//! receive queues, callback dispatch, and send-completion tracking.
//!
//! Every session owns single-worker pools for its send, receive, and
//! callback stages; strict FIFO per stage is what provides the ordering
//! guarantees. With `crypto_parallelism > 0` two more pools exist: a
//! single-worker crypt stage that serializes cipher batches, and an
//! N-worker compute pool the parallel cipher drivers fan out onto. In that
//! mode the receive stage reads raw ciphertext and re-queues itself before
//! decryption finishes, so network reads overlap cipher work.
//!
//! Stage jobs hold only weak references back to the session; dropping the
//! user-facing [`Session`] handle disconnects the transport and quiesces
//! every pool.

use crate::buffer::PacketBuffer;
use crate::packet::{packet_type, Packet, PacketFlags, PacketHeader, PacketId, PacketType};
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::debug;
use veil_crypto::block::{decrypt_parallel, encrypt_parallel, padded_len};
use veil_runtime::WorkerPool;
use veil_transport::{SecureTransport, TransportError};

/// Callback invoked on the callback stage after a packet send attempt,
/// with the packet id and the bytes actually written. A count below the
/// header plus body length signals failure.
pub type SentCallback = Arc<dyn Fn(PacketId, u64) + Send + Sync>;

/// Callback invoked on the callback stage when a packet of the registered
/// type arrives, with the packet and the body bytes actually received.
/// Packets with a registered callback never enter the type queues.
pub type RecvCallback = Arc<dyn Fn(Packet, u64) + Send + Sync>;

/// Outcome of one receive-stage iteration: schedule the next one, or let
/// the stage drain.
enum StageFlow {
    Continue,
    Stop,
}

/// Type-keyed FIFOs plus the wakeup flag for `pull`.
#[derive(Default)]
struct RecvQueues {
    queues: BTreeMap<PacketType, VecDeque<Packet>>,
    available: bool,
}

/// State shared between the user handle and the stage jobs. Jobs upgrade a
/// `Weak` to this per iteration, so an orphaned pipeline winds down on its
/// own.
struct Shared {
    transport: Arc<SecureTransport>,
    send_stage: WorkerPool,
    recv_stage: WorkerPool,
    callback_stage: WorkerPool,
    /// Serializes cipher batches; present iff `crypto_parallelism > 0`.
    crypt_stage: Option<WorkerPool>,
    /// Compute pool the parallel cipher drivers fan out onto.
    crypt_pool: Option<WorkerPool>,
    next_id: AtomicU32,
    /// Id of the packet currently being sent; `wait` unblocks once it
    /// passes the awaited id.
    current_sending: Mutex<PacketId>,
    sent_advanced: Condvar,
    recv_queues: Mutex<RecvQueues>,
    recv_ready: Condvar,
    sent_callbacks: DashMap<PacketType, SentCallback>,
    recv_callbacks: DashMap<PacketType, RecvCallback>,
}

/// A managed packet session over a [`SecureTransport`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use veil_crypto::os_random;
/// use veil_session::{packet_type, PacketBuffer, PacketFlags, Session};
/// use veil_transport::SecureTransport;
///
/// let transport = Arc::new(SecureTransport::new(os_random()));
/// let session = Session::new(transport, 0);
/// session.connect("127.0.0.1", 4433, true).unwrap();
///
/// let id = session.push(
///     packet_type::PING,
///     PacketFlags::new(),
///     Some(PacketBuffer::from_slice(b"hello")),
/// );
/// session.wait(id);
/// let reply = session.pull(packet_type::PING_REPLY);
/// assert_eq!(reply.header.packet_type, packet_type::PING_REPLY);
/// ```
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Build a session over `transport`.
    ///
    /// `crypto_parallelism` of 0 runs cipher work inline on the send and
    /// receive stages; a positive value moves it onto a dedicated crypt
    /// stage backed by that many compute workers.
    ///
    /// If the transport is already connected (the acceptor path), the
    /// receive pipeline starts immediately.
    #[must_use]
    pub fn new(transport: Arc<SecureTransport>, crypto_parallelism: usize) -> Self {
        let parallel = crypto_parallelism > 0;
        let shared = Arc::new(Shared {
            transport,
            send_stage: WorkerPool::new(1),
            recv_stage: WorkerPool::new(1),
            callback_stage: WorkerPool::new(1),
            crypt_stage: parallel.then(|| WorkerPool::new(1)),
            crypt_pool: parallel.then(|| WorkerPool::new(crypto_parallelism)),
            next_id: AtomicU32::new(1),
            current_sending: Mutex::new(0),
            sent_advanced: Condvar::new(),
            recv_queues: Mutex::new(RecvQueues::default()),
            recv_ready: Condvar::new(),
            sent_callbacks: DashMap::new(),
            recv_callbacks: DashMap::new(),
        });

        // Every session answers liveness probes on its own.
        let weak = Arc::downgrade(&shared);
        shared.recv_callbacks.insert(
            packet_type::KEEP_ALIVE_REQUEST,
            Arc::new(move |packet: Packet, received: u64| {
                if received < packet.header.size {
                    return;
                }
                if let Some(shared) = weak.upgrade() {
                    Shared::push_packet(
                        &shared,
                        Packet {
                            header: PacketHeader {
                                packet_type: packet_type::KEEP_ALIVE_REPLY,
                                ..PacketHeader::default()
                            },
                            buffer: None,
                        },
                    );
                }
            }),
        );

        if shared.transport.is_connected() {
            Shared::push_recv_job(&shared);
        }
        Self { shared }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<SecureTransport> {
        &self.shared.transport
    }

    /// Connect the transport and arm the receive pipeline.
    ///
    /// # Errors
    ///
    /// Propagates the connect or handshake error; the session is unusable
    /// until a later `connect` succeeds.
    pub fn connect(&self, host: &str, port: u16, no_delay: bool) -> Result<(), TransportError> {
        self.disconnect();
        let result = self.shared.transport.connect(host, port, no_delay);
        if self.shared.transport.is_connected() {
            Shared::push_recv_job(&self.shared);
        }
        result
    }

    /// Disconnect the transport. Pending receive iterations are discarded
    /// and blocked [`pull`](Self::pull) calls return.
    pub fn disconnect(&self) {
        self.shared.transport.disconnect();
        self.shared.recv_stage.clear();
        self.shared.recv_ready.notify_all();
    }

    /// Whether the underlying transport believes it is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    /// Queue a packet for sending and return its id.
    ///
    /// The buffer is ciphered in place by the pipeline; the caller must not
    /// touch it after pushing. A `None` buffer sends a header-only packet.
    pub fn push(
        &self,
        packet_type: PacketType,
        flags: PacketFlags,
        buffer: Option<PacketBuffer>,
    ) -> PacketId {
        self.push_packet(Packet {
            header: PacketHeader {
                packet_type,
                flags,
                ..PacketHeader::default()
            },
            buffer,
        })
    }

    /// Queue a caller-built packet. The id and size fields are assigned
    /// here; everything else in the header is sent as provided.
    pub fn push_packet(&self, packet: Packet) -> PacketId {
        Shared::push_packet(&self.shared, packet)
    }

    /// Block until a packet of `packet_type` is available (any type for
    /// [`packet_type::UNDEFINED`]) and return it. Returns a default packet
    /// once the transport disconnects.
    #[must_use]
    pub fn pull(&self, packet_type: PacketType) -> Packet {
        loop {
            if !self.shared.transport.is_connected() {
                return Packet::default();
            }

            let mut queues = self.shared.recv_queues.lock().expect("recv queues poisoned");
            if let Some(packet) = take_matching(&mut queues, packet_type) {
                return packet;
            }

            let transport = &self.shared.transport;
            queues = self
                .shared
                .recv_ready
                .wait_while(queues, |q| !q.available && transport.is_connected())
                .expect("recv queues poisoned");
            queues.available = false;
        }
    }

    /// Number of queued packets of `packet_type`; the total across all
    /// types for [`packet_type::UNDEFINED`].
    #[must_use]
    pub fn pullable(&self, packet_type: PacketType) -> u64 {
        let queues = self.shared.recv_queues.lock().expect("recv queues poisoned");
        if packet_type == packet_type::UNDEFINED {
            queues.queues.values().map(|q| q.len() as u64).sum()
        } else {
            queues
                .queues
                .get(&packet_type)
                .map_or(0, |q| q.len() as u64)
        }
    }

    /// Types that currently have at least one queued packet.
    #[must_use]
    pub fn types_pullable(&self) -> Vec<PacketType> {
        let queues = self.shared.recv_queues.lock().expect("recv queues poisoned");
        queues
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(t, _)| *t)
            .collect()
    }

    /// Block until the packet with `id` has been sent (or has failed and
    /// been reported through the sent-callback).
    pub fn wait(&self, id: PacketId) {
        let mut current = self
            .shared
            .current_sending
            .lock()
            .expect("send progress poisoned");
        while *current <= id {
            current = self
                .shared
                .sent_advanced
                .wait(current)
                .expect("send progress poisoned");
        }
    }

    /// Drop all pending (unsent) packets and every queued received packet.
    pub fn clear(&self) {
        self.shared.send_stage.clear();
        if let Some(crypt_stage) = &self.shared.crypt_stage {
            crypt_stage.clear();
        }
        let mut queues = self.shared.recv_queues.lock().expect("recv queues poisoned");
        queues.queues.clear();
    }

    /// Register a sent-callback for `packet_type`, replacing any previous
    /// one.
    pub fn on_sent<F>(&self, packet_type: PacketType, callback: F)
    where
        F: Fn(PacketId, u64) + Send + Sync + 'static,
    {
        self.shared
            .sent_callbacks
            .insert(packet_type, Arc::new(callback));
    }

    /// Remove the sent-callback for `packet_type`.
    pub fn remove_sent_callback(&self, packet_type: PacketType) {
        self.shared.sent_callbacks.remove(&packet_type);
    }

    /// Register a recv-callback for `packet_type`, replacing any previous
    /// one. Packets of this type are delivered to the callback instead of
    /// the type queue.
    pub fn on_recv<F>(&self, packet_type: PacketType, callback: F)
    where
        F: Fn(Packet, u64) + Send + Sync + 'static,
    {
        self.shared
            .recv_callbacks
            .insert(packet_type, Arc::new(callback));
    }

    /// Remove the recv-callback for `packet_type`; later packets of the
    /// type queue normally again.
    pub fn remove_recv_callback(&self, packet_type: PacketType) {
        self.shared.recv_callbacks.remove(&packet_type);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
        self.shared.send_stage.clear();
        if let Some(crypt_stage) = &self.shared.crypt_stage {
            crypt_stage.clear();
        }

        // Producer stages stop before the pools they feed: a crypt batch in
        // flight must still find live compute workers, and callbacks may be
        // queued by any stage.
        self.shared.send_stage.shutdown();
        self.shared.recv_stage.shutdown();
        if let Some(crypt_stage) = &self.shared.crypt_stage {
            crypt_stage.shutdown();
        }
        if let Some(crypt_pool) = &self.shared.crypt_pool {
            crypt_pool.shutdown();
        }
        self.shared.callback_stage.shutdown();
        debug!("session torn down");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connected", &self.is_connected())
            .field(
                "parallel_crypto",
                &self.shared.crypt_pool.as_ref().map(WorkerPool::size),
            )
            .finish()
    }
}

/// Pop the first packet matching `packet_type`; for `UNDEFINED`, scan the
/// queues in ascending type order.
fn take_matching(queues: &mut RecvQueues, packet_type: PacketType) -> Option<Packet> {
    if packet_type == packet_type::UNDEFINED {
        queues
            .queues
            .values_mut()
            .find_map(std::collections::VecDeque::pop_front)
    } else {
        queues.queues.get_mut(&packet_type)?.pop_front()
    }
}

impl Shared {
    /// Assign the id and size, then hand the packet to the first pipeline
    /// stage.
    fn push_packet(shared: &Arc<Self>, mut packet: Packet) -> PacketId {
        packet.header.id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        packet.header.size = packet.buffer.as_ref().map_or(0, |b| b.size() as u64);
        let id = packet.header.id;

        let weak = Arc::downgrade(shared);
        if let Some(crypt_stage) = &shared.crypt_stage {
            crypt_stage.submit(move || {
                if let Some(shared) = weak.upgrade() {
                    Shared::make_sendable(&shared, packet);
                }
            });
        } else {
            shared.send_stage.submit(move || {
                if let Some(shared) = weak.upgrade() {
                    Shared::send_encrypting(&shared, packet);
                }
            });
        }
        id
    }

    /// Crypt-stage job: encrypt the body on the compute pool, grow the
    /// buffer to the padded length, and hand off to the send stage.
    fn make_sendable(shared: &Arc<Self>, packet: Packet) {
        if let Some(buffer) = &packet.buffer {
            if let Some(key) = shared.transport.session_key() {
                let pool = shared
                    .crypt_pool
                    .as_ref()
                    .expect("crypt pool exists when the crypt stage does");
                let mut raw = buffer.raw();
                let len = raw.len;
                let total = encrypt_parallel(&mut raw.data, len, &key, true, pool.size(), pool);
                raw.len = total;
            }
        }

        let weak = Arc::downgrade(shared);
        shared.send_stage.submit(move || {
            if let Some(shared) = weak.upgrade() {
                Shared::send_preencrypted(&shared, packet);
            }
        });
    }

    /// Send-stage job for the inline-crypto path: header and body both go
    /// through `write_secure`.
    fn send_encrypting(shared: &Arc<Self>, packet: Packet) {
        Self::set_current_sending(shared, packet.header.id);

        let mut header_buf = packet.header.encode();
        let mut written = shared
            .transport
            .write_secure(&mut header_buf, PacketHeader::SIZE);
        if written < PacketHeader::SIZE {
            return Self::complete_send(shared, &packet, written as u64);
        }

        if let Some(buffer) = &packet.buffer {
            let len = {
                let mut raw = buffer.raw();
                let len = raw.len;
                written = shared.transport.write_secure(&mut raw.data, len);
                len
            };
            if written < len {
                return Self::complete_send(shared, &packet, written as u64);
            }
        }
        Self::complete_send(shared, &packet, written as u64);
    }

    /// Send-stage job for the parallel-crypto path: the body is already
    /// ciphertext, only the header still needs the cipher.
    fn send_preencrypted(shared: &Arc<Self>, packet: Packet) {
        Self::set_current_sending(shared, packet.header.id);

        let mut header_buf = packet.header.encode();
        let mut written = shared
            .transport
            .write_secure(&mut header_buf, PacketHeader::SIZE);
        if written < PacketHeader::SIZE {
            return Self::complete_send(shared, &packet, written as u64);
        }

        if let Some(buffer) = &packet.buffer {
            let padded = {
                let raw = buffer.raw();
                written = shared.transport.write_raw(&raw.data[..raw.len]);
                raw.len
            };
            if written < padded {
                return Self::complete_send(shared, &packet, written as u64);
            }
        }
        Self::complete_send(shared, &packet, written as u64);
    }

    /// Advance the completion counter, wake `wait` callers, and queue the
    /// sent-callback (if any) on the callback stage.
    fn complete_send(shared: &Arc<Self>, packet: &Packet, bytes: u64) {
        {
            let mut current = shared
                .current_sending
                .lock()
                .expect("send progress poisoned");
            *current = packet.header.id + 1;
        }
        shared.sent_advanced.notify_all();

        let callback = shared
            .sent_callbacks
            .get(&packet.header.packet_type)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(callback) = callback {
            let id = packet.header.id;
            shared.callback_stage.submit(move || callback(id, bytes));
        }
    }

    fn set_current_sending(shared: &Arc<Self>, id: PacketId) {
        *shared
            .current_sending
            .lock()
            .expect("send progress poisoned") = id;
    }

    /// Keep the receive stage alive: one job per iteration, re-queued from
    /// the iteration's own outcome.
    fn push_recv_job(shared: &Arc<Self>) {
        let weak = Arc::downgrade(shared);
        shared.recv_stage.submit(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let flow = if shared.crypt_stage.is_some() {
                Shared::recv_cycle_raw(&shared)
            } else {
                Shared::recv_cycle_decrypting(&shared)
            };
            if matches!(flow, StageFlow::Continue) {
                Shared::push_recv_job(&shared);
            }
            shared.recv_ready.notify_all();
        });
    }

    fn next_flow(&self) -> StageFlow {
        if self.transport.is_connected() {
            StageFlow::Continue
        } else {
            StageFlow::Stop
        }
    }

    /// Receive iteration with inline decryption: header, body, dispatch.
    fn recv_cycle_decrypting(shared: &Arc<Self>) -> StageFlow {
        if !shared.transport.is_connected() {
            return StageFlow::Stop;
        }

        let mut header_buf = [0u8; PacketHeader::SIZE];
        if shared.transport.read_secure(&mut header_buf, PacketHeader::SIZE) < PacketHeader::SIZE {
            return shared.next_flow();
        }
        let header = PacketHeader::decode(&header_buf);

        let mut packet = Packet {
            header,
            buffer: None,
        };
        let mut received = 0u64;
        if header.size > 0 {
            let buffer = PacketBuffer::new(header.size as usize);
            {
                let mut raw = buffer.raw();
                received = shared
                    .transport
                    .read_secure(&mut raw.data, header.size as usize)
                    as u64;
            }
            packet.buffer = Some(buffer);

            if received < header.size {
                // Short body: report through the callback if one exists,
                // never queue the torso.
                Self::fire_recv_callback(shared, packet, received);
                return shared.next_flow();
            }
        }

        Self::dispatch(shared, packet, received);
        shared.next_flow()
    }

    /// Receive iteration for the parallel path: read the raw ciphertext
    /// body and queue decryption, so the next network read starts while
    /// the cipher runs.
    fn recv_cycle_raw(shared: &Arc<Self>) -> StageFlow {
        if !shared.transport.is_connected() {
            return StageFlow::Stop;
        }

        let mut header_buf = [0u8; PacketHeader::SIZE];
        if shared.transport.read_secure(&mut header_buf, PacketHeader::SIZE) < PacketHeader::SIZE {
            return shared.next_flow();
        }
        let header = PacketHeader::decode(&header_buf);

        let mut packet = Packet {
            header,
            buffer: None,
        };
        let mut received = 0u64;
        if header.size > 0 {
            let buffer = PacketBuffer::new(header.size as usize);
            {
                let mut raw = buffer.raw();
                let padded = padded_len(header.size as usize);
                received = shared.transport.read_raw(&mut raw.data[..padded]) as u64;
            }
            packet.buffer = Some(buffer);

            if received < header.size {
                // Short body: report through the callback if one exists,
                // never queue the torso. Same rule as the inline path.
                Self::fire_recv_callback(shared, packet, received);
                return shared.next_flow();
            }
        }

        let weak = Arc::downgrade(shared);
        shared
            .crypt_stage
            .as_ref()
            .expect("raw receive runs only with a crypt stage")
            .submit(move || {
                if let Some(shared) = weak.upgrade() {
                    Shared::make_pullable(&shared, packet, received);
                }
            });
        shared.next_flow()
    }

    /// Crypt-stage job: decrypt the body on the compute pool and dispatch.
    fn make_pullable(shared: &Arc<Self>, packet: Packet, received: u64) {
        if let Some(buffer) = &packet.buffer {
            if let Some(key) = shared.transport.session_key() {
                let pool = shared
                    .crypt_pool
                    .as_ref()
                    .expect("crypt pool exists when the crypt stage does");
                let mut raw = buffer.raw();
                let len = raw.len;
                decrypt_parallel(&mut raw.data, len, &key, true, pool.size(), pool);
            }
        }

        Self::dispatch(shared, packet, received);
        shared.recv_ready.notify_all();
    }

    /// Deliver a completed packet: recv-callback if registered, otherwise
    /// the type queue (honoring REMOVE_PREVIOUS).
    fn dispatch(shared: &Arc<Self>, packet: Packet, received: u64) {
        if Self::fire_recv_callback(shared, packet.clone(), received) {
            return;
        }

        let mut queues = shared.recv_queues.lock().expect("recv queues poisoned");
        let queue = queues.queues.entry(packet.header.packet_type).or_default();
        if packet.header.flags.removes_previous() {
            queue.clear();
        }
        queue.push_back(packet);
        queues.available = true;
    }

    /// Queue the recv-callback for this packet type, if one is registered.
    fn fire_recv_callback(shared: &Arc<Self>, packet: Packet, received: u64) -> bool {
        let callback = shared
            .recv_callbacks
            .get(&packet.header.packet_type)
            .map(|entry| Arc::clone(entry.value()));
        match callback {
            Some(callback) => {
                shared
                    .callback_stage
                    .submit(move || callback(packet, received));
                true
            }
            None => false,
        }
    }
}
