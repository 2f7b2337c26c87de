//! Kernel queue worker pool
//!
//! Each worker binds one NFQUEUE number and runs a blocking receive
//! loop on its own thread. Per packet the worker takes a configuration
//! snapshot (one `Arc` clone under a read lock, so a packet can never
//! observe a torn configuration), classifies the packet, and either
//! accepts it untouched or spawns a replay task and drops the
//! original. The queue read path never sleeps.

mod iface;

use crate::config::Config;
use crate::engine;
use crate::filter::TargetMatcher;
use crate::flow::{FlowKey, FlowTable, FlowVerdict};
use crate::packet::{self, IpFamily};
use crate::sni;
use crate::sock::RawSender;
use crate::error::{Error, Result};
use nfq::{Queue, Verdict};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// What to do with a packet after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Hand the packet back to the kernel untouched
    Accept,
    /// Drop the original and replay it through the strategy engine
    /// with the set at this index
    Replay(usize),
    /// Accept the original SYN but emit a fake alongside it
    SynFake(usize),
    /// Drop without replay (QUIC is detect-and-drop only)
    Drop,
}

/// Shared state of the worker pool
pub struct Pool {
    config: RwLock<Arc<Config>>,
    matcher: RwLock<Arc<TargetMatcher>>,
    flows: RwLock<Arc<FlowTable>>,
    geosite: HashMap<String, Vec<String>>,
    packets_processed: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl Pool {
    /// Build a pool around an initial configuration. `geosite` holds
    /// the pre-resolved category lists from the external reader.
    pub fn new(config: Config, geosite: HashMap<String, Vec<String>>) -> Self {
        let matcher = TargetMatcher::compile(&config.sets, &geosite);
        let flows = FlowTable::new(config.system.conn_bytes_limit);
        Self {
            config: RwLock::new(Arc::new(config)),
            matcher: RwLock::new(Arc::new(matcher)),
            flows: RwLock::new(Arc::new(flows)),
            geosite,
            packets_processed: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current configuration snapshot; readers are lock-free apart
    /// from the pointer clone.
    pub fn snapshot(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Atomically replace the configuration. In-flight packets keep
    /// the snapshot they took; new packets see the new configuration
    /// whole. Invalid configurations are rejected before any
    /// replacement.
    pub fn update_config(&self, new: Config) -> Result<()> {
        new.validate()?;

        let matcher = Arc::new(TargetMatcher::compile(&new.sets, &self.geosite));
        let limit_changed = self.snapshot().system.conn_bytes_limit != new.system.conn_bytes_limit;

        *self.matcher.write() = matcher;
        if limit_changed {
            *self.flows.write() = Arc::new(FlowTable::new(new.system.conn_bytes_limit));
        }
        *self.config.write() = Arc::new(new);
        info!("configuration replaced");
        Ok(())
    }

    /// Packets seen since start
    pub fn packets_processed(&self) -> u64 {
        self.packets_processed.load(Ordering::Relaxed)
    }

    /// Classify one raw packet. Pure apart from flow-table side
    /// effects; the hot path accepts anything it cannot parse.
    pub fn classify(&self, raw: &[u8], mark: u32) -> Action {
        let cfg = self.snapshot();
        if mark == cfg.queue.mark {
            return Action::Accept;
        }
        let Some(family) = IpFamily::of(raw) else {
            return Action::Accept;
        };
        if raw.len() < family.min_header_len() {
            return Action::Accept;
        }
        if (family == IpFamily::V4 && !cfg.queue.ipv4) || (family == IpFamily::V6 && !cfg.queue.ipv6)
        {
            return Action::Accept;
        }

        let (proto, ip_header_len) = match family {
            IpFamily::V4 => (raw[9], ((raw[0] & 0x0f) as usize) * 4),
            IpFamily::V6 => (raw[6], packet::IPV6_HEADER_LEN),
        };

        match proto {
            6 => self.classify_tcp(raw, family, ip_header_len),
            17 => self.classify_udp(raw, ip_header_len),
            _ => Action::Accept,
        }
    }

    fn classify_tcp(&self, raw: &[u8], family: IpFamily, ip_header_len: usize) -> Action {
        if raw.len() < ip_header_len + 20 {
            return Action::Accept;
        }
        let tcp = &raw[ip_header_len..];
        let dport = u16::from_be_bytes([tcp[2], tcp[3]]);
        if dport != 443 {
            return Action::Accept;
        }

        let data_off = ((tcp[12] >> 4) as usize) * 4;
        if tcp.len() < data_off {
            return Action::Accept;
        }
        let payload = &tcp[data_off..];
        let flags = tcp[13];

        if payload.is_empty() {
            // outbound SYN: optionally shadowed by a fake
            if flags & 0x02 != 0 && flags & 0x10 == 0 {
                let cfg = self.snapshot();
                if let Some(idx) = cfg
                    .sets
                    .iter()
                    .position(|s| s.enabled && s.tcp.syn_fake)
                {
                    return Action::SynFake(idx);
                }
            }
            return Action::Accept;
        }

        let key = FlowKey {
            src: packet::src_addr(raw, family),
            src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
            dst: packet::dst_addr(raw, family),
            dst_port: dport,
        };

        let flows = self.flows.read().clone();
        match flows.push(key, payload) {
            FlowVerdict::Resolved(host) => {
                let matcher = self.matcher.read().clone();
                match matcher.match_host(&host) {
                    Some(idx) => {
                        debug!(host, set = idx, "TLS SNI matched");
                        Action::Replay(idx)
                    }
                    None => {
                        trace!(host, "TLS SNI not targeted");
                        Action::Accept
                    }
                }
            }
            FlowVerdict::Pending | FlowVerdict::Rejected => Action::Accept,
        }
    }

    fn classify_udp(&self, raw: &[u8], ip_header_len: usize) -> Action {
        if raw.len() < ip_header_len + 8 {
            return Action::Accept;
        }
        let udp = &raw[ip_header_len..];
        let dport = u16::from_be_bytes([udp[2], udp[3]]);
        if dport != 443 {
            return Action::Accept;
        }

        match sni::quic::extract_sni(&udp[8..]) {
            Some(host) => {
                let matcher = self.matcher.read().clone();
                if matcher.match_host(&host).is_some() {
                    debug!(host, "QUIC SNI matched, dropping Initial");
                    // detect-and-drop only: the client falls back to TCP
                    // where the TCP strategies apply
                    Action::Drop
                } else {
                    Action::Accept
                }
            }
            None => Action::Accept,
        }
    }

    /// Bind the configured number of workers and run them on dedicated
    /// threads. Replay tasks land on `handle`.
    pub fn start(self: &Arc<Self>, handle: tokio::runtime::Handle) -> Result<Vec<std::thread::JoinHandle<()>>> {
        let cfg = self.snapshot();
        let mut workers = Vec::with_capacity(cfg.queue.threads);
        for i in 0..cfg.queue.threads {
            let queue_num = cfg.queue.queue_num + i as u16;
            let worker = Worker::bind(self.clone(), queue_num, &cfg)?;
            let handle = handle.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("sidestep-q{queue_num}"))
                    .spawn(move || worker.run(handle))
                    .map_err(Error::Io)?,
            );
        }
        info!(
            workers = cfg.queue.threads,
            first_queue = cfg.queue.queue_num,
            "worker pool started"
        );
        Ok(workers)
    }

    /// Ask every worker loop to wind down
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// One bound queue
pub struct Worker {
    pool: Arc<Pool>,
    queue: Queue,
    queue_num: u16,
    sender: Arc<RawSender>,
}

impl Worker {
    /// Open and configure the queue binding; fatal at startup when the
    /// kernel refuses.
    fn bind(pool: Arc<Pool>, queue_num: u16, cfg: &Config) -> Result<Self> {
        let sender = Arc::new(RawSender::open(cfg.queue.mark)?);

        let mut queue = Queue::open().map_err(|e| Error::QueueBind {
            queue_num,
            message: e.to_string(),
        })?;
        queue.bind(queue_num).map_err(|e| Error::QueueBind {
            queue_num,
            message: e.to_string(),
        })?;
        queue
            .set_fail_open(queue_num, true)
            .map_err(|e| Error::QueueBind {
                queue_num,
                message: e.to_string(),
            })?;
        if cfg.queue.use_gso {
            queue.set_recv_gso(queue_num, true);
        }
        if cfg.queue.use_conntrack {
            queue
                .set_recv_conntrack(queue_num, true)
                .map_err(|e| Error::QueueBind {
                    queue_num,
                    message: e.to_string(),
                })?;
        }

        Ok(Self {
            pool,
            queue,
            queue_num,
            sender,
        })
    }

    /// Blocking receive loop; one verdict per packet
    fn run(mut self, handle: tokio::runtime::Handle) {
        info!(queue = self.queue_num, "worker listening");
        loop {
            if self.pool.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let mut msg = match self.queue.recv() {
                Ok(msg) => msg,
                Err(err) => {
                    if self.pool.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!(queue = self.queue_num, %err, "queue receive failed");
                    continue;
                }
            };

            self.pool.packets_processed.fetch_add(1, Ordering::Relaxed);

            let cfg = self.pool.snapshot();
            if !iface::matches_interface(&cfg.queue.interfaces, msg.get_indev(), msg.get_outdev()) {
                msg.set_verdict(Verdict::Accept);
                let _ = self.queue.verdict(msg);
                continue;
            }

            let raw = msg.get_payload().to_vec();
            let action = self.pool.classify(&raw, msg.get_nfmark());

            let verdict = match action {
                Action::Accept => Verdict::Accept,
                Action::Drop => Verdict::Drop,
                Action::Replay(idx) => {
                    if let Some(set) = cfg.sets.get(idx).cloned() {
                        let sender = self.sender.clone();
                        handle.spawn(async move {
                            let plan = {
                                let mut rng = rand::thread_rng();
                                engine::plan_packet(&raw, &set, &mut rng)
                            };
                            match plan {
                                Ok(plan) => engine::execute(&sender, plan).await,
                                Err(err) => tracing::error!(%err, "replay planning failed"),
                            }
                        });
                    }
                    Verdict::Drop
                }
                Action::SynFake(idx) => {
                    if let Some(set) = cfg.sets.get(idx) {
                        let mut rng = rand::thread_rng();
                        if let Ok(plan) = engine::plan_syn(&raw, set, &mut rng) {
                            for emission in plan {
                                if let Err(err) = self.sender.send(&emission.data) {
                                    tracing::error!(%err, "SYN fake injection failed");
                                }
                            }
                        }
                    }
                    Verdict::Accept
                }
            };

            msg.set_verdict(verdict);
            if let Err(err) = self.queue.verdict(msg) {
                warn!(queue = self.queue_num, %err, "verdict failed");
            }
        }
        info!(queue = self.queue_num, "worker stopped");
    }
}
