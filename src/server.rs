//! Wires the UDP control socket, HTTP front door and background sweeps
//! together around one shared redirection/peer state.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use codec::{KeySet, Message};
use parking_lot::RwLock;
use tokio::time::{interval, Duration};
use transport::Transport;

use crate::config::{Config, StaticConfig};
use crate::peers::PeerTable;
use crate::redirect::RedirectTable;

const GOSSIP_INTERVAL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(30);
const MAX_DATAGRAM: usize = 1400;

/// All process-wide state, confined to this one struct so no handler
/// ever needs more than an `Arc<PortalState>` to do its job.
pub struct PortalState {
    pub config: Config,
    pub redirects: RedirectTable,
    pub peers: PeerTable,
    pub keys: RwLock<KeySet>,
    pub transport: Transport,
    /// Set by a `LOCAL` directive in the static config: suppresses the
    /// gossip heartbeat and restricts the control socket to loopback
    /// senders.
    pub local_only: std::sync::atomic::AtomicBool,
}

pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before 1970")
        .as_secs() as i64
}

fn apply_static_config(state: &PortalState, cfg: StaticConfig) {
    state.redirects.deprecate_all();
    for r in cfg.redirects {
        let _ = state
            .redirects
            .add_or_renew(r.path, r.service, r.target, r.hide, None, false, now());
    }

    for p in cfg.peers {
        state.peers.add_static(p.host);
    }

    *state.keys.write() = cfg.keys;
    state
        .local_only
        .store(cfg.local_only, std::sync::atomic::Ordering::Relaxed);
}

/// Binds the control socket, loads the static config and spawns the
/// background loops. Returns the shared state for the HTTP layer to
/// mount; the UDP/gossip/sweep/reload loops run for the life of the
/// process as detached tasks.
pub async fn run(config: Config, static_cfg: StaticConfig) -> anyhow::Result<Arc<PortalState>> {
    let transport = Transport::bind(config.udp_port, config.bind_v6).await;
    let host = config.host.clone();

    let state = Arc::new(PortalState {
        config,
        redirects: RedirectTable::default(),
        peers: PeerTable::default(),
        keys: RwLock::new(KeySet::default()),
        transport,
        local_only: std::sync::atomic::AtomicBool::new(false),
    });

    state.peers.set_own_host(host);
    apply_static_config(&state, static_cfg);

    tokio::spawn(udp_loop(state.clone()));
    tokio::spawn(gossip_loop(state.clone()));
    tokio::spawn(sweep_loop(state.clone()));
    tokio::spawn(reload_loop(state.clone()));

    Ok(state)
}

/// Receives control datagrams and applies them to the shared tables.
/// Per-datagram errors (bad signature, malformed body, full table) are
/// logged and the loop continues — one bad packet never brings down the
/// listener.
async fn udp_loop(state: Arc<PortalState>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (size, from) = match state.transport.recv(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("control socket receive error: {e}");
                continue;
            }
        };

        if state.local_only.load(std::sync::atomic::Ordering::Relaxed) && !from.ip().is_loopback() {
            log::trace!("dropping control datagram from {from}: portal is in LOCAL mode");
            continue;
        }

        let line = match std::str::from_utf8(&buf[..size]) {
            Ok(s) => s,
            Err(_) => {
                log::warn!("control datagram from {from} was not valid utf-8");
                continue;
            }
        };

        let body = match state.keys.read().verify(line) {
            Ok(body) => body.to_string(),
            Err(e) => {
                log::warn!("control datagram from {from} rejected: {e}");
                continue;
            }
        };

        let msg = match Message::parse(&body) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("control datagram from {from} malformed: {e}");
                continue;
            }
        };

        apply_message(&state, msg, &from.ip().to_string());
    }
}

fn apply_message(state: &PortalState, msg: Message, sender_ip: &str) {
    match msg {
        Message::Redirect { target, hide, pid, paths, .. } => {
            for p in paths {
                let _ = state.redirects.add_or_renew(
                    p.path,
                    p.service,
                    target.clone(),
                    hide,
                    pid,
                    true,
                    now(),
                );
            }
        }
        Message::Peer { peers, .. } => {
            // The sender always lists its own host[:port] as the first
            // entry (see gossip_loop), so this loop learns the sender
            // itself along with everything it relays — no separate
            // sender_ip-based learning is needed.
            for entry in peers {
                if state.peers.learn(entry.clone(), now()) {
                    log::info!("PEER/RECOVER host={}", entry.host);
                }
            }
        }
        Message::Local => {
            log::trace!("ignoring LOCAL directive from {sender_ip}: runtime, not config");
        }
        Message::Sign { .. } => {
            log::trace!("ignoring SIGN directive from {sender_ip}: runtime, not config");
        }
    }
}

/// Broadcasts and unicasts this portal's current peer list every 30s —
/// the gossip heartbeat that keeps `PEER/EXPIRE` from firing on peers
/// that are still alive.
async fn gossip_loop(state: Arc<PortalState>) {
    let mut tick = interval(GOSSIP_INTERVAL);
    loop {
        tick.tick().await;

        if state.local_only.load(std::sync::atomic::Ordering::Relaxed) {
            continue;
        }

        let mut peers: Vec<_> = vec![codec::PeerEntry { host: state.config.host.clone(), expiration: None }];
        peers.extend(
            state
                .peers
                .live_hosts()
                .into_iter()
                .map(|host| codec::PeerEntry { host, expiration: None }),
        );

        let static_targets = state.peers.static_hosts();

        let msg = Message::Peer { timestamp: Some(now()), peers };
        let line = state.keys.read().sign(&msg.to_string());

        if let Err(e) = state.transport.send_broadcast(line.as_bytes()).await {
            log::warn!("gossip broadcast failed: {e}");
        }

        for host in &static_targets {
            if let Err(e) = state.transport.send_unicast(host, line.as_bytes()).await {
                log::warn!("gossip unicast to {host} failed: {e}");
            }
        }
    }
}

/// Expires stale peers, reaps tombstoned peers and lapsed redirection
/// leases. Runs more often than the gossip interval so `PEER/EXPIRE`
/// fires promptly once a lease actually lapses.
async fn sweep_loop(state: Arc<PortalState>) {
    let mut tick = interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        let t = now();

        for host in state.peers.expire(t) {
            log::info!("PEER/EXPIRE host={host}");
        }
        state.peers.reap(t);
        state.redirects.reap(t);
    }
}

/// Polls the static config file's mtime and reloads it on change,
/// letting an operator edit `/etc/house/portal.config` without
/// restarting the process.
async fn reload_loop(state: Arc<PortalState>) {
    let mut tick = interval(RELOAD_POLL_INTERVAL);
    let mut last_mtime = state.config.mtime();

    loop {
        tick.tick().await;

        let mtime = state.config.mtime();
        if mtime == last_mtime {
            continue;
        }
        last_mtime = mtime;

        match state.config.reload() {
            Ok(cfg) => {
                log::info!("reloaded static config from {:?}", state.config.config_path);
                apply_static_config(&state, cfg);
            }
            Err(e) => log::warn!("config reload failed, keeping previous config: {e}"),
        }
    }
}
