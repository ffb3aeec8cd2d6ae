use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, trace};

use crate::arch::ArchProfile;
use crate::pcie::PcieBridge;
use crate::ring::dtd::TagDirectory;

const DEFAULT_BUFFER_SIZE: u64 = 1024;
// window within which another node's traffic counts as contention
const CONTENTION_WINDOW: u64 = 10;

#[derive(Debug, Clone)]
pub struct RingConfig {
    pub num_nodes: usize,
    pub num_rings: usize,
    pub latency_cycles: u64,
    pub buffer_size: u64,
    pub bandwidth_mbps: u32,
    pub dtd_enabled: bool,
    pub enable_contention: bool,
}

impl RingConfig {
    pub fn for_profile(profile: &ArchProfile) -> Self {
        Self {
            num_nodes: profile.num_tiles,
            num_rings: profile.num_rings,
            latency_cycles: profile.ring_latency_cycles,
            buffer_size: DEFAULT_BUFFER_SIZE,
            bandwidth_mbps: profile.ring_bandwidth_mbps,
            dtd_enabled: true,
            enable_contention: true,
        }
    }
}

/// One message in flight. The payload is owned by the message: moved in on
/// send, handed to the caller on receive, dropped with the message otherwise.
#[derive(Debug, Clone)]
pub struct RingMessage {
    pub source: usize,
    pub dest: usize,
    pub priority: u8,
    pub payload: Vec<u8>,
    pub timestamp: u64,
    pub delivery_time: u64,
    pub ring: usize,
    position: usize,
    moved_at: u64,
}

#[derive(Debug, Default, Clone)]
pub struct NodeStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_transmitted: u64,
    pub contention_cycles: u64,
}

struct RingNode {
    node_id: usize,
    inbound: VecDeque<RingMessage>,
    outbound: Vec<VecDeque<RingMessage>>,
    buffer_occupancy: u64,
    last_activity: u64,
    stats: NodeStats,
}

impl RingNode {
    fn new(node_id: usize, num_rings: usize) -> Self {
        Self {
            node_id,
            inbound: VecDeque::new(),
            outbound: (0..num_rings).map(|_| VecDeque::new()).collect(),
            buffer_occupancy: 0,
            last_activity: 0,
            stats: NodeStats::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub node_id: usize,
    pub inbound_len: usize,
    pub outbound_len: usize,
    pub buffer_occupancy: u64,
    pub stats: NodeStats,
}

#[derive(Debug, Default, Clone)]
pub struct RingStats {
    pub total_messages: u64,
    pub total_bytes: u64,
    pub total_latency: u64,
    pub max_delay: u64,
    pub sim_time: u64,
}

impl RingStats {
    pub fn avg_latency(&self) -> u64 {
        if self.total_messages > 0 {
            self.total_latency / self.total_messages
        } else {
            0
        }
    }

    pub fn avg_message_size(&self) -> u64 {
        if self.total_messages > 0 {
            self.total_bytes / self.total_messages
        } else {
            0
        }
    }
}

struct Network {
    nodes: Vec<RingNode>,
    dtd: TagDirectory,
}

/// Bidirectional ring interconnect, one node per tile. KNL runs two rings;
/// a message picks its ring by `(source + dest) % 2`.
///
/// The simulation thread is the only mover of queued messages: it advances
/// each message one hop per step and never re-enters `send`.
pub struct RingBus {
    config: RingConfig,
    network: Mutex<Network>,
    sim_time: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    total_latency: AtomicU64,
    max_delay: AtomicU64,
    running: AtomicBool,
    sim_thread: Mutex<Option<JoinHandle<()>>>,
    pcie: Option<Arc<PcieBridge>>,
}

impl RingBus {
    pub fn new(profile: &ArchProfile, pcie: Option<Arc<PcieBridge>>) -> Self {
        Self::with_config(RingConfig::for_profile(profile), pcie)
    }

    pub fn with_config(config: RingConfig, pcie: Option<Arc<PcieBridge>>) -> Self {
        assert!(config.num_nodes > 0, "ring needs at least one node");
        assert!(config.num_rings >= 1);

        info!(
            "ring bus: {} nodes, {} ring(s), {} MB/s, latency {} cycles",
            config.num_nodes, config.num_rings, config.bandwidth_mbps, config.latency_cycles
        );

        let nodes = (0..config.num_nodes)
            .map(|i| RingNode::new(i, config.num_rings))
            .collect();
        let dtd = TagDirectory::new(config.num_nodes);

        Self {
            config,
            network: Mutex::new(Network { nodes, dtd }),
            sim_time: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            total_latency: AtomicU64::new(0),
            max_delay: AtomicU64::new(0),
            running: AtomicBool::new(false),
            sim_thread: Mutex::new(None),
            pcie,
        }
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.sim_time.load(Ordering::Relaxed)
    }

    /// Shortest-distance hop count between two nodes.
    pub fn distance(&self, a: usize, b: usize) -> u64 {
        let n = self.config.num_nodes as u64;
        let direct = (a as i64 - b as i64).unsigned_abs();
        direct.min(n - direct)
    }

    /// Next node toward `to`, in the direction that minimizes the distance.
    /// Ties go toward increasing index.
    pub fn next_hop(&self, from: usize, to: usize) -> usize {
        if from == to {
            return from;
        }
        let n = self.config.num_nodes;
        let cw = (to + n - from) % n;
        let ccw = (from + n - to) % n;
        if cw <= ccw {
            (from + 1) % n
        } else {
            (from + n - 1) % n
        }
    }

    pub fn ring_for(&self, source: usize, dest: usize) -> usize {
        if self.config.num_rings > 1 {
            (source + dest) % self.config.num_rings
        } else {
            0
        }
    }

    /// Enqueue a message. Returns false when the indices are invalid, the
    /// payload is empty, or the source buffer cannot take it.
    pub fn send(&self, source: usize, dest: usize, payload: &[u8], priority: u8) -> bool {
        let n = self.config.num_nodes;
        if source >= n || dest >= n || payload.is_empty() {
            return false;
        }

        let size = payload.len() as u64;
        let now = self.now();
        let mut net = self.network.lock().expect("network lock poisoned");

        if net.nodes[source].buffer_occupancy + size > self.config.buffer_size {
            trace!("ring: send {}->{} rejected, buffer full", source, dest);
            return false;
        }

        // Memory-shaped payloads consult the directory; a write-back detours
        // the message via the line's home tile.
        let mut actual_dest = dest;
        let mut dtd_extra = 0u64;
        if self.config.dtd_enabled && size >= 8 {
            let addr = u64::from_le_bytes(payload[..8].try_into().expect("len checked"));
            let action = net.dtd.consult(addr, source, size > 8, now);
            dtd_extra = action.extra_hops;
            if let Some(home) = action.redirect_home {
                actual_dest = home;
                if let Some(pcie) = &self.pcie {
                    pcie.record_invalidation();
                }
            }
            if dtd_extra > 0 {
                if let Some(pcie) = &self.pcie {
                    pcie.record_coherency_cycles(dtd_extra);
                }
            }
        }

        let ring = self.ring_for(source, actual_dest);

        if source == actual_dest {
            // no wire to cross; receivable immediately
            let message = RingMessage {
                source,
                dest: actual_dest,
                priority,
                payload: payload.to_vec(),
                timestamp: now,
                delivery_time: now,
                ring,
                position: source,
                moved_at: now,
            };
            let node = &mut net.nodes[source];
            node.inbound.push_back(message);
            node.last_activity = now;
            node.stats.messages_sent += 1;
            node.stats.bytes_transmitted += size;
        } else {
            let contention = if self.config.enable_contention {
                let delay = self.contention_delay(&net.nodes, source, actual_dest, now);
                net.nodes[source].stats.contention_cycles += delay;
                delay
            } else {
                0
            };

            let delivery_time = now
                + self.distance(source, actual_dest) * self.config.latency_cycles
                + dtd_extra
                + contention;

            let message = RingMessage {
                source,
                dest: actual_dest,
                priority,
                payload: payload.to_vec(),
                timestamp: now,
                delivery_time,
                ring,
                position: source,
                moved_at: now,
            };

            let node = &mut net.nodes[source];
            node.outbound[ring].push_back(message);
            node.buffer_occupancy += size;
            node.last_activity = now;
            node.stats.messages_sent += 1;
            node.stats.bytes_transmitted += size;
        }

        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// One message per destination, at broadcast priority. Arrivals are
    /// independent, never atomic across receivers.
    pub fn broadcast(&self, source: usize, payload: &[u8]) -> bool {
        let mut ok = true;
        for dest in 0..self.config.num_nodes {
            if dest != source {
                ok &= self.send(source, dest, payload, 1);
            }
        }
        ok
    }

    /// Pop the head of `node`'s inbound queue once its delivery time has
    /// come. The payload moves out with the returned message.
    pub fn receive(&self, node: usize) -> Option<RingMessage> {
        if node >= self.config.num_nodes {
            return None;
        }
        let now = self.now();
        let mut net = self.network.lock().expect("network lock poisoned");
        let ready = net.nodes[node]
            .inbound
            .front()
            .map(|m| now >= m.delivery_time)
            .unwrap_or(false);
        if !ready {
            return None;
        }
        let message = net.nodes[node].inbound.pop_front().expect("head checked");
        let node = &mut net.nodes[node];
        node.stats.messages_received += 1;
        node.last_activity = now;

        let latency = now - message.timestamp;
        self.total_latency.fetch_add(latency, Ordering::Relaxed);
        self.max_delay.fetch_max(latency, Ordering::Relaxed);
        Some(message)
    }

    /// Advance simulated time one cycle and move every queued message one
    /// hop. A message blocked by a full downstream buffer stays put and
    /// charges contention to the node it is stuck at.
    pub fn step(&self) {
        let now = self.sim_time.fetch_add(1, Ordering::Relaxed) + 1;
        let mut net = self.network.lock().expect("network lock poisoned");

        for i in 0..net.nodes.len() {
            for ring in 0..self.config.num_rings {
                let pending = net.nodes[i].outbound[ring].len();
                for _ in 0..pending {
                    let Some(message) = net.nodes[i].outbound[ring].pop_front() else {
                        break;
                    };
                    if message.moved_at >= now {
                        // already advanced this cycle
                        net.nodes[i].outbound[ring].push_back(message);
                        continue;
                    }

                    let size = message.payload.len() as u64;
                    let next = self.next_hop(message.position, message.dest);

                    if next == message.dest {
                        let mut message = message;
                        message.position = next;
                        message.moved_at = now;
                        net.nodes[i].buffer_occupancy -= size;
                        net.nodes[i].last_activity = now;
                        net.nodes[next].inbound.push_back(message);
                        // keep arrivals receivable oldest-delivery-first
                        net.nodes[next]
                            .inbound
                            .make_contiguous()
                            .sort_by_key(|m| m.delivery_time);
                    } else if net.nodes[next].buffer_occupancy + size <= self.config.buffer_size {
                        let mut message = message;
                        message.position = next;
                        message.moved_at = now;
                        net.nodes[i].buffer_occupancy -= size;
                        net.nodes[i].last_activity = now;
                        net.nodes[next].buffer_occupancy += size;
                        net.nodes[next].outbound[ring].push_back(message);
                    } else {
                        // blocked; retry next cycle
                        net.nodes[i].stats.contention_cycles += 1;
                        net.nodes[i].outbound[ring].push_back(message);
                    }
                }
            }
        }
    }

    /// Step the simulation `cycles` times.
    pub fn step_many(&self, cycles: u64) {
        for _ in 0..cycles {
            self.step();
        }
    }

    fn contention_delay(&self, nodes: &[RingNode], source: usize, dest: usize, now: u64) -> u64 {
        let mut delay = 0;
        for node in nodes {
            let active = node.stats.messages_sent + node.stats.messages_received > 0;
            if node.node_id != source
                && node.node_id != dest
                && active
                && now.saturating_sub(node.last_activity) < CONTENTION_WINDOW
            {
                delay += 1;
            }
        }
        delay.min(self.config.buffer_size / 64)
    }

    /// Run the routing loop on a background thread until `stop`.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = Arc::clone(&self);
        let handle = std::thread::spawn(move || {
            while bus.running.load(Ordering::Relaxed) {
                bus.step();
                std::thread::sleep(Duration::from_micros(100));
            }
        });
        *self.sim_thread.lock().expect("thread slot poisoned") = Some(handle);
        info!("ring bus simulation started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sim_thread.lock().expect("thread slot poisoned").take() {
            let _ = handle.join();
        }
        info!("ring bus simulation stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_latency: self.total_latency.load(Ordering::Relaxed),
            max_delay: self.max_delay.load(Ordering::Relaxed),
            sim_time: self.now(),
        }
    }

    pub fn node_snapshot(&self, node: usize) -> Option<NodeSnapshot> {
        let net = self.network.lock().expect("network lock poisoned");
        net.nodes.get(node).map(|n| NodeSnapshot {
            node_id: n.node_id,
            inbound_len: n.inbound.len(),
            outbound_len: n.outbound.iter().map(|q| q.len()).sum(),
            buffer_occupancy: n.buffer_occupancy,
            stats: n.stats.clone(),
        })
    }

    /// Directory state for one line, if tracked.
    pub fn directory_line(&self, address: u64) -> Option<crate::ring::dtd::CacheLine> {
        let net = self.network.lock().expect("network lock poisoned");
        net.dtd.lookup(address).cloned()
    }

    pub fn directory_stats(&self, tile: usize) -> Option<crate::ring::dtd::DirectoryStats> {
        let net = self.network.lock().expect("network lock poisoned");
        net.dtd.tile_stats(tile).cloned()
    }

    pub fn dtd_home(&self, address: u64) -> usize {
        let net = self.network.lock().expect("network lock poisoned");
        net.dtd.home_of(address)
    }

    pub fn reset(&self) {
        let mut net = self.network.lock().expect("network lock poisoned");
        for node in &mut net.nodes {
            node.inbound.clear();
            for q in &mut node.outbound {
                q.clear();
            }
            node.buffer_occupancy = 0;
            node.last_activity = 0;
            node.stats = NodeStats::default();
        }
        net.dtd.reset();
        self.sim_time.store(0, Ordering::Relaxed);
        self.total_messages.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.total_latency.store(0, Ordering::Relaxed);
        self.max_delay.store(0, Ordering::Relaxed);
    }

    pub fn log_network_state(&self) {
        let net = self.network.lock().expect("network lock poisoned");
        info!(
            "ring: {} nodes, dtd {}",
            net.nodes.len(),
            if self.config.dtd_enabled { "on" } else { "off" }
        );
        for node in &net.nodes {
            info!(
                "  node {}: in={} out={} occupancy={}B sent={} recv={}",
                node.node_id,
                node.inbound.len(),
                node.outbound.iter().map(|q| q.len()).sum::<usize>(),
                node.buffer_occupancy,
                node.stats.messages_sent,
                node.stats.messages_received,
            );
        }
    }
}
