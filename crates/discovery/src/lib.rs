//! Two-phase discovery crawl: a fast peer-list poll every 10s finds new
//! portals, a slower service-list poll every 120s (or 3s after a new
//! portal is found) finds what they serve.
//!
//! The catalog never forgets a service instance once seen — it only
//! moves from "current" to "lapsed" after 120s of silence. A client
//! relying on stale-but-last-known routing info is a deliberate
//! trade-off for a home network where a service blinking offline for a
//! minute shouldn't evict every caller's cached endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::interval;

const PEER_POLL_INTERVAL: Duration = Duration::from_secs(10);
const SERVICE_POLL_INTERVAL: Duration = Duration::from_secs(120);
const NEW_PORTAL_FOLLOWUP_DELAY: Duration = Duration::from_secs(3);
const LAPSE_AFTER: i64 = 120;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

#[derive(Debug, Deserialize)]
struct PeersResponse {
    portal: PeersPortal,
}

#[derive(Debug, Deserialize)]
struct PeersPortal {
    peers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    host: String,
    portal: ListPortal,
}

#[derive(Debug, Deserialize)]
struct ListPortal {
    redirect: Vec<RedirectView>,
}

#[derive(Debug, Deserialize, Clone)]
struct RedirectView {
    path: String,
    service: Option<String>,
}

/// One entry in the discovery catalog, keyed by the portal-fronted URL
/// a caller should actually request — `http://<portal-host><path>`, not
/// the backend's own address, since every request still goes through
/// the portal's redirect table.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub portal: String,
    pub path: String,
    pub service: Option<String>,
    pub url: String,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl ServiceInstance {
    pub fn is_current(&self, at: i64) -> bool {
        at - self.last_seen < LAPSE_AFTER
    }
}

#[derive(Default)]
struct Catalog {
    by_url: HashMap<String, ServiceInstance>,
}

impl Catalog {
    fn observe(&mut self, portal: &str, host: &str, entry: RedirectView, at: i64) {
        let url = format!("http://{host}{}", entry.path);

        self.by_url
            .entry(url.clone())
            .and_modify(|e| {
                e.service = entry.service.clone();
                e.last_seen = at;
            })
            .or_insert_with(|| ServiceInstance {
                portal: portal.to_string(),
                path: entry.path,
                service: entry.service,
                url,
                first_seen: at,
                last_seen: at,
            });
    }
}

/// Crawls a federation of portals for their peer lists and registered
/// services, exposing a never-shrinking catalog plus a change
/// notification hook.
pub struct DiscoveryClient {
    http: reqwest::Client,
    known_portals: Mutex<HashSet<String>>,
    catalog: Mutex<Catalog>,
    on_change: Mutex<Vec<Box<dyn Fn(&ServiceInstance) + Send + Sync>>>,
}

impl DiscoveryClient {
    pub fn new(seed_portal_http: impl Into<String>) -> Arc<Self> {
        let mut known = HashSet::new();
        known.insert(seed_portal_http.into());

        Arc::new(Self {
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().expect("reqwest client"),
            known_portals: Mutex::new(known),
            catalog: Mutex::new(Catalog::default()),
            on_change: Mutex::new(Vec::new()),
        })
    }

    pub fn on_change(&self, f: impl Fn(&ServiceInstance) + Send + Sync + 'static) {
        self.on_change.lock().push(Box::new(f));
    }

    /// Every instance this client has ever seen for `service`, current
    /// or lapsed — callers that want only live routes should filter by
    /// [`ServiceInstance::is_current`] themselves.
    pub fn instances_for(&self, service: &str) -> Vec<ServiceInstance> {
        self.catalog
            .lock()
            .by_url
            .values()
            .filter(|i| i.service.as_deref() == Some(service))
            .cloned()
            .collect()
    }

    pub fn known_portals(&self) -> Vec<String> {
        self.known_portals.lock().iter().cloned().collect()
    }

    async fn poll_peers(self: &Arc<Self>) -> bool {
        let portals: Vec<String> = self.known_portals.lock().iter().cloned().collect();
        let mut discovered_new = false;

        for portal in portals {
            let url = format!("{portal}/portal/peers");
            let resp = match self.http.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("peer poll of {portal} failed: {e}");
                    continue;
                }
            };

            let body: PeersResponse = match resp.json().await {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("peer poll of {portal} returned unparsable body: {e}");
                    continue;
                }
            };

            let mut known = self.known_portals.lock();
            for host in body.portal.peers {
                let peer_url = format!("http://{host}");
                if known.insert(peer_url) {
                    discovered_new = true;
                }
            }
        }

        discovered_new
    }

    async fn poll_services(self: &Arc<Self>) {
        let portals: Vec<String> = self.known_portals.lock().iter().cloned().collect();
        let at = now();

        for portal in portals {
            let url = format!("{portal}/portal/list");
            let resp = match self.http.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("service poll of {portal} failed: {e}");
                    continue;
                }
            };

            let body: ListResponse = match resp.json().await {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("service poll of {portal} returned unparsable body: {e}");
                    continue;
                }
            };

            for entry in body.portal.redirect {
                if entry.service.is_none() {
                    continue;
                }
                let mut catalog = self.catalog.lock();
                catalog.observe(&portal, &body.host, entry, at);
            }
        }

        let snapshot: Vec<ServiceInstance> = self.catalog.lock().by_url.values().cloned().collect();
        let listeners = self.on_change.lock();
        for instance in &snapshot {
            for l in listeners.iter() {
                l(instance);
            }
        }
    }

    /// Spawns the peer and service crawl loops. Runs for the life of
    /// the returned handle's owner.
    pub fn run(self: Arc<Self>) {
        let a = self.clone();
        tokio::spawn(async move { a.peer_loop().await });

        let b = self.clone();
        tokio::spawn(async move { b.service_loop().await });
    }

    async fn peer_loop(self: Arc<Self>) {
        let mut tick = interval(PEER_POLL_INTERVAL);
        loop {
            tick.tick().await;
            if self.poll_peers().await {
                let client = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(NEW_PORTAL_FOLLOWUP_DELAY).await;
                    client.poll_services().await;
                });
            }
        }
    }

    async fn service_loop(self: Arc<Self>) {
        let mut tick = interval(SERVICE_POLL_INTERVAL);
        loop {
            tick.tick().await;
            self.poll_services().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> RedirectView {
        RedirectView { path: path.into(), service: Some("svc".into()) }
    }

    #[test]
    fn catalog_tracks_first_and_last_seen() {
        let mut c = Catalog::default();
        c.observe("http://portal", "portal-host:80", entry("/shop"), 100);
        c.observe("http://portal", "portal-host:80", entry("/shop"), 150);

        let i = c.by_url.get("http://portal-host:80/shop").unwrap();
        assert_eq!(i.first_seen, 100);
        assert_eq!(i.last_seen, 150);
    }

    #[test]
    fn catalog_url_is_portal_fronted_not_backend_target() {
        let mut c = Catalog::default();
        c.observe("http://portal", "portal-host:80", entry("/shop"), 100);
        let i = c.by_url.values().next().unwrap();
        assert_eq!(i.url, "http://portal-host:80/shop");
    }

    #[test]
    fn entry_lapses_after_120s_silence() {
        let instance = ServiceInstance {
            portal: "p".into(),
            path: "/x".into(),
            service: None,
            url: "http://portal-host:80/x".into(),
            first_seen: 0,
            last_seen: 0,
        };
        assert!(instance.is_current(100));
        assert!(!instance.is_current(120));
    }
}
