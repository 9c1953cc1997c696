//! Registers a process's HTTP paths with its local portal over the UDP
//! control protocol, and keeps the lease renewed every 30s so it never
//! lapses while the process is alive.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use codec::{KeySet, Message, PathEntry};
use tokio::time::{interval, Duration};
use transport::Transport;

const RENEWAL_INTERVAL: Duration = Duration::from_secs(30);
const MAX_DATAGRAM: usize = 1400;

/// An `(external -> internal)` port rewrite from `-portal-map=EXT:INT`.
/// The service's own HTTP listener binds `internal`; the Portal and the
/// outside world only ever see `external` in the advertised target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    pub external: u16,
    pub internal: u16,
}

impl PortMap {
    /// Parses the `EXT:INT` form of `-portal-map`.
    pub fn parse(s: &str) -> Option<Self> {
        let (ext, int) = s.split_once(':')?;
        Some(Self { external: ext.trim().parse().ok()?, internal: int.trim().parse().ok()? })
    }
}

/// Builds the `target` advertised in a REDIRECT registration from the
/// service's own internal webport, applying any matching port rewrite
/// and the local/remote host-substitution rule: a Portal on the same
/// host only needs the port, a remote Portal needs the client's
/// hostname too so it can redirect browsers back to it.
pub fn advertised_target(host: Option<&str>, webport: u16, port_maps: &[PortMap]) -> String {
    let published_port = port_maps.iter().find(|m| m.internal == webport).map(|m| m.external).unwrap_or(webport);

    match host {
        Some(h) => format!("{h}:{published_port}"),
        None => published_port.to_string(),
    }
}

#[derive(Debug)]
pub enum Error {
    Transport(transport::Error),
    NoPaths,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "client transport error: {e}"),
            Self::NoPaths => write!(f, "registration has no paths to advertise"),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// One path to advertise: `service:path` if `service` is set, else a
/// bare path.
#[derive(Debug, Clone)]
pub struct Registration {
    pub service: Option<String>,
    pub path: String,
}

/// Splits `paths` into the fewest `REDIRECT` message bodies that each
/// stay under [`MAX_DATAGRAM`] once signed — a service registering
/// dozens of routes must not silently lose the tail of the list to a
/// single oversized, dropped datagram.
fn pack_messages(target: &str, hide: bool, pid: u32, paths: &[Registration]) -> Vec<Message> {
    let mut out = Vec::new();
    let mut batch: Vec<PathEntry> = Vec::new();

    let estimate = |batch: &[PathEntry]| -> usize {
        target.len() + 32 + batch.iter().map(|p| p.path.len() + p.service.as_ref().map_or(0, |s| s.len() + 1) + 1).sum::<usize>()
    };

    for reg in paths {
        let candidate = PathEntry { service: reg.service.clone(), path: reg.path.clone() };
        let mut trial = batch.clone();
        trial.push(candidate.clone());

        if !batch.is_empty() && estimate(&trial) > MAX_DATAGRAM {
            out.push(Message::Redirect {
                timestamp: Some(now()),
                target: target.to_string(),
                hide,
                pid: Some(pid),
                paths: std::mem::take(&mut batch),
            });
        }
        batch.push(candidate);
    }

    if !batch.is_empty() {
        out.push(Message::Redirect {
            timestamp: Some(now()),
            target: target.to_string(),
            hide,
            pid: Some(pid),
            paths: batch,
        });
    }

    out
}

/// A live registration with its local portal. Dropping this does not
/// deregister the paths — they simply lapse at the end of their
/// current 180s lease once renewals stop.
pub struct Client {
    transport: Transport,
    portal_addr: String,
    keys: KeySet,
    target: String,
    hide: bool,
    pid: u32,
    paths: Vec<Registration>,
}

impl Client {
    /// Binds an ephemeral local UDP socket for talking to the portal at
    /// `portal_host:portal_port`. `host` is this service's own hostname
    /// if the Portal is remote (`None` if it's local — then only the
    /// port is advertised), `webport` is the service's own internal
    /// HTTP listener port, and `port_maps` applies any
    /// `-portal-map=EXT:INT` rewrite before the port is published.
    pub async fn connect(
        portal_host: &str,
        portal_port: u16,
        keys: KeySet,
        host: Option<String>,
        webport: u16,
        port_maps: &[PortMap],
        hide: bool,
        paths: Vec<Registration>,
    ) -> Result<Self, Error> {
        if paths.is_empty() {
            return Err(Error::NoPaths);
        }

        let target = advertised_target(host.as_deref(), webport, port_maps);
        let transport = Transport::bind(0, false).await;
        Ok(Self {
            transport,
            portal_addr: format!("{portal_host}:{portal_port}"),
            keys,
            target,
            hide,
            pid: std::process::id(),
            paths,
        })
    }

    /// Sends one registration round (one or more signed datagrams,
    /// batched to stay under the wire budget).
    pub async fn register(&self) -> Result<(), Error> {
        for msg in pack_messages(&self.target, self.hide, self.pid, &self.paths) {
            let line = self.keys.sign(&msg.to_string());
            self.transport.send_unicast(&self.portal_addr, line.as_bytes()).await?;
        }
        Ok(())
    }

    /// Registers once, then renews every 30s for as long as the handle
    /// is held — a process keeps this task running for its lifetime.
    pub async fn run(self: Arc<Self>) {
        let mut tick = interval(RENEWAL_INTERVAL);
        loop {
            if let Err(e) = self.register().await {
                log::warn!("portal registration failed: {e}");
            }
            tick.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(path: &str) -> Registration {
        Registration { service: Some("svc".into()), path: path.into() }
    }

    #[test]
    fn single_small_batch_produces_one_message() {
        let msgs = pack_messages("10.0.0.1:9000", false, 1, &[reg("/a"), reg("/b")]);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn oversized_registration_splits_into_multiple_datagrams() {
        let paths: Vec<_> = (0..200).map(|i| reg(&format!("/path-segment-{i}"))).collect();
        let msgs = pack_messages("10.0.0.1:9000", false, 1, &paths);
        assert!(msgs.len() > 1);

        for msg in &msgs {
            assert!(msg.to_string().len() <= MAX_DATAGRAM);
        }
    }

    #[test]
    fn port_map_rewrites_internal_to_external() {
        let maps = [PortMap { external: 8443, internal: 9443 }];
        assert_eq!(advertised_target(None, 9443, &maps), "8443");
    }

    #[test]
    fn unmapped_port_passes_through_unchanged() {
        assert_eq!(advertised_target(None, 9000, &[]), "9000");
    }

    #[test]
    fn remote_portal_includes_hostname() {
        let maps = [PortMap { external: 8443, internal: 9443 }];
        assert_eq!(advertised_target(Some("attic.lan"), 9443, &maps), "attic.lan:8443");
    }

    #[test]
    fn parses_ext_colon_int() {
        let m = PortMap::parse("8443:9443").unwrap();
        assert_eq!(m, PortMap { external: 8443, internal: 9443 });
    }

    #[test]
    fn every_path_appears_exactly_once_across_batches() {
        let paths: Vec<_> = (0..50).map(|i| reg(&format!("/p{i}"))).collect();
        let msgs = pack_messages("10.0.0.1:9000", false, 1, &paths);

        let total: usize = msgs
            .iter()
            .map(|m| match m {
                Message::Redirect { paths, .. } => paths.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total, 50);
    }
}
