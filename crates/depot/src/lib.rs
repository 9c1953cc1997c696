//! Depot client: follows whichever depot replica has the freshest copy
//! of a subscribed key, failing over to another replica after 180s of
//! silence from the current one.
//!
//! This is quorum-*like* convergence, not consensus — the client simply
//! adopts whatever replica reports the highest timestamp for a key. Two
//! replicas can disagree forever if they're partitioned from each
//! other; nothing here detects or repairs that split. See
//! [`CacheEntry`] for the `active <= detected` invariant this enforces.
//!
//! A file revision's upgrade occurs as soon as it appears on one Depot;
//! a downgrade only occurs once the chosen Depot itself reports the
//! rollback, or after it has gone silent for 180s and some other Depot
//! takes over.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use discovery::DiscoveryClient;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::interval;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const FAILOVER_AFTER: i64 = 180;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEPOT_SERVICE_NAME: &str = "depot";

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    updated: i64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    host: String,
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: String,
    time: i64,
}

pub type Listener = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Per-key subscription state.
///
/// `active` is the timestamp of the content last handed to the
/// listener; `detected` is the timestamp last observed via a depot's
/// full listing, which can run ahead of `active` while the full body is
/// still being fetched. The invariant `active <= detected` always
/// holds: a key is never considered delivered before it was even seen.
pub struct CacheEntry {
    repo: String,
    name: String,
    listener: Listener,
    active: i64,
    detected: i64,
    host: Option<String>,
    host_alive: i64,
    refreshing: bool,
}

impl CacheEntry {
    /// A not-yet-delivered entry with a no-op listener, for scenario
    /// tests exercising [`DepotClient::converge`] without a network
    /// round trip.
    pub fn fresh(repo: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            name: name.into(),
            listener: Box::new(|_, _| {}),
            active: 0,
            detected: 0,
            host: None,
            host_alive: 0,
            refreshing: false,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn detected(&self) -> i64 {
        self.detected
    }

    pub fn active(&self) -> i64 {
        self.active
    }
}

pub struct DepotClient {
    http: reqwest::Client,
    discovery: Arc<DiscoveryClient>,
    group: String,
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Last `updated` timestamp reported by each provider's `/check`, so
    /// a full listing fetch is skipped when nothing changed there.
    provider_checks: Mutex<HashMap<String, i64>>,
}

impl DepotClient {
    pub fn new(discovery: Arc<DiscoveryClient>) -> Arc<Self> {
        Self::with_group(discovery, "home")
    }

    pub fn with_group(discovery: Arc<DiscoveryClient>, group: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().expect("reqwest client"),
            discovery,
            group: group.into(),
            entries: Mutex::new(HashMap::new()),
            provider_checks: Mutex::new(HashMap::new()),
        })
    }

    fn key(&self, repo: &str, name: &str) -> String {
        format!("{repo}/{}/{name}", self.group)
    }

    /// Registers interest in `name` within `repo`; `listener` is invoked
    /// with the raw body every time a fresher copy is fetched. A second
    /// subscription to the same `(repo, name)` with a different listener
    /// is a conflict and is rejected with a warning, matching
    /// `housedepositor_subscribe`'s own behavior.
    pub fn subscribe(&self, repo: impl Into<String>, name: impl Into<String>, listener: Listener) {
        let repo = repo.into();
        let name = name.into();
        let key = self.key(&repo, &name);

        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            log::warn!("depot registration conflict for {key}");
            return;
        }
        entries.insert(
            key,
            CacheEntry { repo, name, listener, active: 0, detected: 0, host: None, host_alive: 0, refreshing: false },
        );
    }

    /// Publishes new content for `(repo, name)` to every discovered depot
    /// replica. On success the local cache is primed to the push
    /// timestamp so the refresh loop doesn't immediately pull back the
    /// data this call just pushed.
    pub async fn put(&self, repo: &str, name: &str, body: &[u8]) -> anyhow::Result<()> {
        let providers = self.discovery.instances_for(DEPOT_SERVICE_NAME);
        if providers.is_empty() {
            anyhow::bail!("no discovered depot replica for put({repo}/{name})");
        }

        let ts = now();
        let mut delivered = 0usize;

        for provider in &providers {
            let url = format!("{}/{repo}/{}/{name}?time={ts}", provider.url, self.group);
            match self.http.put(&url).body(body.to_vec()).send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => delivered += 1,
                Err(e) => log::warn!("depot put to {} for {repo}/{name} failed: {e}", provider.url),
            }
        }

        if delivered == 0 {
            anyhow::bail!("put({repo}/{name}) reached no depot replica");
        }

        let key = self.key(repo, name);
        if let Some(entry) = self.entries.lock().get_mut(&key) {
            entry.active = ts;
            entry.detected = ts;
        }
        Ok(())
    }

    /// Applies one depot's reported timestamp for an entry, following
    /// `housedepositor_scan_response`'s three-way rule.
    pub fn converge(entry: &mut CacheEntry, reporting_host: &str, timestamp: i64, at: i64) {
        if entry.active == 0 {
            if entry.detected < timestamp {
                entry.host = Some(reporting_host.to_string());
                entry.detected = timestamp;
                entry.host_alive = at;
            }
        } else if entry.host.as_deref() == Some(reporting_host) {
            entry.detected = timestamp;
            entry.host_alive = at;
        } else if entry.host_alive < at - FAILOVER_AFTER {
            entry.host = Some(reporting_host.to_string());
            entry.detected = timestamp;
            entry.host_alive = at;
        }
    }

    async fn scan_provider(&self, provider_url: &str) {
        let check_url = format!("{provider_url}/check");
        let resp = match self.http.get(&check_url).send().await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("depot check against {provider_url} failed: {e}");
                return;
            }
        };
        let check: CheckResponse = match resp.json().await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("depot check against {provider_url} returned bad body: {e}");
                return;
            }
        };

        let advanced = {
            let mut checks = self.provider_checks.lock();
            let prev = checks.insert(provider_url.to_string(), check.updated);
            prev != Some(check.updated)
        };
        if !advanced {
            return;
        }

        let repos: HashSet<String> = self.entries.lock().values().map(|e| e.repo.clone()).collect();
        let at = now();

        for repo in repos {
            let list_url = format!("{provider_url}/{repo}/{}/all", self.group);
            let resp = match self.http.get(&list_url).send().await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("depot listing of {repo} at {provider_url} failed: {e}");
                    continue;
                }
            };
            let listing: ListResponse = match resp.json().await {
                Ok(l) => l,
                Err(e) => {
                    log::warn!("depot listing of {repo} at {provider_url} returned bad body: {e}");
                    continue;
                }
            };

            let mut entries = self.entries.lock();
            for file in listing.files {
                let key = self.key(&repo, &file.name);
                if let Some(entry) = entries.get_mut(&key) {
                    Self::converge(entry, &listing.host, file.time, at);
                }
            }
        }
    }

    async fn refresh_due(&self) {
        let due: Vec<(String, String, String)> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|(_, e)| !e.refreshing && e.detected != e.active && e.host.is_some())
                .map(|(key, e)| {
                    e.refreshing = true;
                    (key.clone(), e.host.clone().unwrap(), e.repo.clone())
                })
                .collect()
        };

        for (key, host, repo) in due {
            let name = {
                let entries = self.entries.lock();
                entries.get(&key).map(|e| e.name.clone())
            };
            let Some(name) = name else { continue };

            let uri = format!("/depot/{repo}/{}/{name}", self.group);
            let url = format!("http://{host}{uri}");
            let fetched = self.http.get(&url).send().await.and_then(|r| r.error_for_status());

            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key) else { continue };
            entry.refreshing = false;

            match fetched {
                Ok(resp) => match resp.bytes().await {
                    Ok(body) => {
                        let detected = entry.detected;
                        (entry.listener)(&key, &body);
                        entry.active = detected;
                    }
                    Err(e) => {
                        log::warn!("depot get from {host} for {key} returned unreadable body: {e}");
                        entry.detected = entry.active;
                    }
                },
                Err(e) => {
                    log::warn!("depot get from {host} for {key} failed: {e}");
                    entry.detected = entry.active;
                }
            }
        }
    }

    pub fn run(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = interval(REFRESH_INTERVAL);
            loop {
                tick.tick().await;

                let providers: Vec<String> =
                    self.discovery.instances_for(DEPOT_SERVICE_NAME).into_iter().map(|i| i.url).collect();
                for provider in providers {
                    self.scan_provider(&provider).await;
                }

                self.refresh_due().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Arc<DepotClient> {
        DepotClient::new(DiscoveryClient::new("http://portal:80"))
    }

    #[test]
    fn fresh_subscription_starts_with_active_leq_detected() {
        let c = client();
        c.subscribe("config", "theme", Box::new(|_, _| {}));
        let entries = c.entries.lock();
        let e = entries.get("config/home/theme").unwrap();
        assert!(e.active <= e.detected);
    }

    #[test]
    fn undelivered_entry_adopts_max_timestamp_across_depots() {
        let mut entry = CacheEntry {
            repo: "config".into(), name: "theme".into(), listener: Box::new(|_, _| {}),
            active: 0, detected: 0, host: None, host_alive: 0, refreshing: false,
        };
        DepotClient::converge(&mut entry, "d1:80", 100, 100);
        DepotClient::converge(&mut entry, "d2:80", 150, 100);
        assert_eq!(entry.detected, 150);
        assert_eq!(entry.host.as_deref(), Some("d2:80"));

        // A lower timestamp from a different depot does not win.
        DepotClient::converge(&mut entry, "d3:80", 120, 100);
        assert_eq!(entry.detected, 150);
    }

    #[test]
    fn chosen_host_is_followed_even_backward_once_active() {
        let mut entry = CacheEntry {
            repo: "config".into(), name: "theme".into(), listener: Box::new(|_, _| {}),
            active: 150, detected: 150, host: Some("d2:80".into()), host_alive: 100, refreshing: false,
        };
        DepotClient::converge(&mut entry, "d2:80", 90, 200);
        assert_eq!(entry.detected, 90);
        assert_eq!(entry.host.as_deref(), Some("d2:80"));
    }

    #[test]
    fn failover_only_after_180s_of_silence_from_chosen_host() {
        let mut entry = CacheEntry {
            repo: "config".into(), name: "theme".into(), listener: Box::new(|_, _| {}),
            active: 150, detected: 150, host: Some("d2:80".into()), host_alive: 100, refreshing: false,
        };
        // d3 reports but d2 has only been silent 50s: no failover.
        DepotClient::converge(&mut entry, "d3:80", 500, 150);
        assert_eq!(entry.host.as_deref(), Some("d2:80"));
        assert_eq!(entry.detected, 150);

        // d2 has now been silent 200s: d3 takes over.
        DepotClient::converge(&mut entry, "d3:80", 500, 300);
        assert_eq!(entry.host.as_deref(), Some("d3:80"));
        assert_eq!(entry.detected, 500);
    }
}
