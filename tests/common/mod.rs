//! Deterministic in-memory driver wiring several swarms together.
//!
//! The driver plays the role of the host: it executes every action a
//! swarm emits (delivering `Send` bytes to the linked peer, scheduling
//! timers on a virtual clock, tearing down links on `CloseConnection`)
//! and collects the events each swarm surfaces. Nothing here touches a
//! socket or a real clock, so every test run is reproducible.

use std::collections::{BTreeSet, HashMap, HashSet};

use filament::{Action, Direction, DisconnectReason, Event, Swarm};

/// Install a subscriber so `RUST_LOG=trace cargo test` shows core logs.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestNet {
    pub swarms: Vec<Swarm>,
    pub now_ms: u64,
    /// Collected events per swarm.
    pub events: Vec<Vec<Event>>,
    /// Every `Send` payload that crossed the virtual wire.
    pub wire_log: Vec<(usize, Vec<u8>)>,
    addrs: Vec<String>,
    /// (swarm, conn) -> (peer swarm, peer conn)
    links: HashMap<(usize, u64), (usize, u64)>,
    listeners: HashMap<String, (usize, u64)>,
    /// (fire_at, swarm, timer_id), ordered by time then swarm.
    timers: BTreeSet<(u64, usize, u64)>,
    cancelled: HashSet<(usize, u64)>,
    /// Directed drops: traffic from .0 to .1 vanishes.
    partitions: HashSet<(usize, usize)>,
}

impl TestNet {
    /// Build `swarms`, give each an address and start it listening.
    pub fn with_swarms(swarms: Vec<Swarm>) -> Self {
        let count = swarms.len();
        let addrs: Vec<String> = (0..count)
            .map(|i| format!("/ip4/127.0.0.1/tcp/{}", 41000 + i))
            .collect();
        let mut net = Self {
            swarms,
            now_ms: 0,
            events: vec![Vec::new(); count],
            wire_log: Vec::new(),
            addrs,
            links: HashMap::new(),
            listeners: HashMap::new(),
            timers: BTreeSet::new(),
            cancelled: HashSet::new(),
            partitions: HashSet::new(),
        };
        for i in 0..count {
            let addr = net.addrs[i].clone();
            net.swarms[i].listen(&addr).expect("listen on test addr");
        }
        net.run();
        net
    }

    /// Build `count` default-config swarms seeded `base_seed + index`.
    pub fn new(count: usize, base_seed: u64) -> Self {
        let swarms = (0..count)
            .map(|i| Swarm::builder().rng_seed(base_seed + i as u64).build())
            .collect();
        Self::with_swarms(swarms)
    }

    /// Dial from `a` to `b` and drive the network to quiescence. By the
    /// time this returns both connections are secured.
    pub fn connect(&mut self, a: usize, b: usize) {
        let addr = self.addrs[b].clone();
        self.swarms[a].dial(&addr).expect("dial test addr");
        self.run();
    }

    /// Drop all traffic sent from `a` toward `b`.
    pub fn partition(&mut self, a: usize, b: usize) {
        self.partitions.insert((a, b));
    }

    /// Execute actions until every swarm is quiescent.
    pub fn run(&mut self) {
        loop {
            let mut progressed = false;
            for i in 0..self.swarms.len() {
                let actions = self.swarms[i].poll();
                if !actions.is_empty() {
                    progressed = true;
                }
                for action in actions {
                    self.execute(i, action);
                }
                let events = self.swarms[i].drain_events();
                self.events[i].extend(events);
            }
            if !progressed {
                break;
            }
        }
    }

    /// Advance the virtual clock, firing due timers in order.
    pub fn advance(&mut self, ms: u64) {
        let target = self.now_ms + ms;
        loop {
            let due = self
                .timers
                .iter()
                .find(|(at, swarm, timer)| {
                    *at <= target && !self.cancelled.contains(&(*swarm, *timer))
                })
                .copied();
            let Some(entry) = due else { break };
            self.timers.remove(&entry);
            let (at, swarm, timer_id) = entry;
            self.now_ms = self.now_ms.max(at);
            self.swarms[swarm]
                .on_timer(timer_id, self.now_ms)
                .expect("on_timer accepts any id");
            self.run();
        }
        self.now_ms = target;
    }

    /// Take and reset the events collected for one swarm.
    pub fn take_events(&mut self, i: usize) -> Vec<Event> {
        std::mem::take(&mut self.events[i])
    }

    /// Connection ids of `a` as secured against each peer, in event order.
    pub fn established(&self, i: usize) -> Vec<(u64, filament::PeerId)> {
        self.events[i]
            .iter()
            .filter_map(|e| match e {
                Event::ConnectionEstablished { conn_id, peer } => Some((*conn_id, *peer)),
                _ => None,
            })
            .collect()
    }

    fn execute(&mut self, i: usize, action: Action) {
        match action {
            Action::Listen { listener_id, addr } => {
                self.listeners.insert(addr, (i, listener_id));
            }
            Action::Accept { .. } => {}
            Action::Dial { pending_id, addr } => {
                let (j, listener_id) = *self
                    .listeners
                    .get(&addr)
                    .unwrap_or_else(|| panic!("dialed unknown addr {addr}"));
                let conn_i = self.swarms[i]
                    .on_connection_opened(pending_id, &addr, Direction::Outbound)
                    .expect("pending dial known");
                let dialer_addr = self.addrs[i].clone();
                let conn_j = self.swarms[j]
                    .on_connection_opened(listener_id, &dialer_addr, Direction::Inbound)
                    .expect("listener known");
                self.links.insert((i, conn_i), (j, conn_j));
                self.links.insert((j, conn_j), (i, conn_i));
            }
            Action::Send { conn_id, bytes } => {
                self.wire_log.push((i, bytes.clone()));
                let Some(&(j, peer_conn)) = self.links.get(&(i, conn_id)) else {
                    return;
                };
                if self.partitions.contains(&(i, j)) {
                    return;
                }
                // The peer may already have torn the connection down.
                let _ = self.swarms[j].on_data_received(peer_conn, &bytes, self.now_ms);
            }
            Action::CloseConnection { conn_id } => {
                if let Some((j, peer_conn)) = self.links.remove(&(i, conn_id)) {
                    self.links.remove(&(j, peer_conn));
                    let _ = self.swarms[j].on_connection_closed(peer_conn, DisconnectReason::Remote);
                }
            }
            Action::SetTimer { timer_id, duration_ms } => {
                self.timers.insert((self.now_ms + duration_ms, i, timer_id));
            }
            Action::CancelTimer { timer_id } => {
                self.cancelled.insert((i, timer_id));
            }
        }
    }
}
