//! The redirection table: longest-prefix URL to target, with leases.
//!
//! A live entry (registered over the control socket) carries a 180s lease
//! and is renewed by the owning service every 30s; it answers with a 302
//! so clients never cache the mapping. A permanent entry (loaded from the
//! static config file) never expires and answers with a 301.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

pub const LEASE_SECONDS: i64 = 180;
const CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub path: String,
    pub service: Option<String>,
    pub target: String,
    pub hide: bool,
    pub pid: Option<u32>,
    pub start: i64,
    /// 0 = permanent, 1 = tombstoned (pending reap), else absolute unix
    /// expiry.
    pub expiration: i64,
}

impl Entry {
    fn is_tombstoned(&self) -> bool {
        self.expiration == 1
    }
}

#[derive(Debug)]
pub enum RedirectError {
    TableFull,
}

/// Process-wide, path-keyed redirection table. A single lock guards the
/// whole map — lookups and mutations are O(n) over at most 128 entries,
/// so a shared lock costs nothing an async handler would notice, and
/// nothing here ever holds the lock across an `.await`.
#[derive(Default)]
pub struct RedirectTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RedirectTable {
    /// Registers or renews one path. `live` selects a 180s lease vs a
    /// permanent (0) entry; a permanent entry already in the table is
    /// never downgraded by a live registration racing in behind it.
    pub fn add_or_renew(
        &self,
        path: String,
        service: Option<String>,
        target: String,
        hide: bool,
        pid: Option<u32>,
        live: bool,
        now: i64,
    ) -> Result<(), RedirectError> {
        let mut map = self.entries.lock();

        if let Some(existing) = map.get_mut(&path) {
            if existing.expiration == 0 {
                return Ok(());
            }

            if existing.target != target || existing.pid != pid {
                existing.start = now;
            }
            existing.target = target;
            existing.service = service;
            existing.hide = hide;
            existing.pid = pid;
            existing.expiration = if live { now + LEASE_SECONDS } else { 0 };
            log::info!("ROUTE/UPDATED path={} target={}", path, existing.target);
            return Ok(());
        }

        if map.len() >= CAPACITY {
            log::warn!("redirection table full ({CAPACITY}), dropping {path}");
            return Err(RedirectError::TableFull);
        }

        map.insert(
            path.clone(),
            Entry {
                path: path.clone(),
                service,
                target,
                hide,
                pid,
                start: now,
                expiration: if live { now + LEASE_SECONDS } else { 0 },
            },
        );
        log::info!("ROUTE/ADDED path={path}");
        Ok(())
    }

    /// Longest matching non-tombstoned prefix for `uri`, matching only on
    /// path-segment boundaries (`/shop` matches `/shop/cart`, not
    /// `/shopping`).
    pub fn resolve(&self, uri: &str) -> Option<Entry> {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_tombstoned())
            .filter(|e| {
                uri.starts_with(e.path.as_str())
                    && matches!(uri.as_bytes().get(e.path.len()), None | Some(b'/'))
            })
            .max_by_key(|e| e.path.len())
            .cloned()
    }

    /// Computes the redirect status and target location for a resolved
    /// entry. `hide` strips the matched prefix from the forwarded path;
    /// otherwise the full original URI is forwarded unchanged.
    pub fn dispatch(entry: &Entry, uri: &str, query: &str) -> (u16, String) {
        let rest = if entry.hide {
            let stripped = &uri[entry.path.len()..];
            if stripped.is_empty() {
                "/".to_string()
            } else {
                stripped.to_string()
            }
        } else {
            uri.to_string()
        };

        let mut location = format!("http://{}{}", entry.target, rest);
        if !query.is_empty() {
            location.push('?');
            location.push_str(query);
        }

        let status = if entry.expiration == 0 { 301 } else { 302 };
        (status, location)
    }

    /// Removes every entry whose expiration has passed (including
    /// tombstoned entries, whose `expiration` of 1 always qualifies).
    /// Returns the removed paths for logging/observation.
    pub fn reap(&self, now: i64) -> Vec<String> {
        let mut map = self.entries.lock();
        let mut removed = Vec::new();

        map.retain(|path, e| {
            let expired = e.expiration > 0 && e.expiration <= now;
            if expired {
                removed.push(path.clone());
            }
            !expired
        });

        for path in &removed {
            log::info!("ROUTE/REMOVED path={path}");
        }
        removed
    }

    /// Marks every permanent entry for removal on the next [`Self::reap`]
    /// — used when the static config file is reloaded and no longer
    /// lists a path that used to be permanent.
    pub fn deprecate_all(&self) {
        for e in self.entries.lock().values_mut() {
            if e.expiration == 0 {
                e.expiration = 1;
            }
        }
    }

    pub fn list(&self) -> Vec<Entry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn by_service<'s>(&self, name: &'s str) -> Vec<Entry> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.service.as_deref() == Some(name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(path: &str, live: bool, now: i64) -> RedirectTable {
        let t = RedirectTable::default();
        t.add_or_renew(path.to_string(), None, "127.0.0.1:9000".into(), false, None, live, now)
            .unwrap();
        t
    }

    #[test]
    fn longest_prefix_wins() {
        let t = RedirectTable::default();
        t.add_or_renew("/shop".into(), None, "a:1".into(), false, None, true, 0)
            .unwrap();
        t.add_or_renew("/shop/cart".into(), None, "b:2".into(), false, None, true, 0)
            .unwrap();

        let hit = t.resolve("/shop/cart/items").unwrap();
        assert_eq!(hit.path, "/shop/cart");
    }

    #[test]
    fn segment_boundary_is_respected() {
        let t = table_with("/shop", true, 0);
        assert!(t.resolve("/shopping").is_none());
        assert!(t.resolve("/shop").is_some());
        assert!(t.resolve("/shop/cart").is_some());
    }

    #[test]
    fn permanent_entry_is_never_downgraded_by_live_renewal() {
        let t = table_with("/shop", false, 0);
        t.add_or_renew("/shop".into(), None, "c:3".into(), false, None, true, 100)
            .unwrap();
        assert_eq!(t.resolve("/shop").unwrap().expiration, 0);
    }

    #[test]
    fn reap_removes_only_expired_leases() {
        let t = RedirectTable::default();
        t.add_or_renew("/live".into(), None, "a:1".into(), false, None, true, 0).unwrap();
        t.add_or_renew("/perm".into(), None, "b:2".into(), false, None, false, 0).unwrap();

        let removed = t.reap(LEASE_SECONDS + 1);
        assert_eq!(removed, vec!["/live".to_string()]);
        assert!(t.resolve("/perm").is_some());
    }

    #[test]
    fn deprecate_all_then_reap_clears_permanents() {
        let t = table_with("/shop", false, 0);
        t.deprecate_all();
        let removed = t.reap(i64::MAX);
        assert_eq!(removed, vec!["/shop".to_string()]);
        assert!(t.resolve("/shop").is_none());
    }

    #[test]
    fn table_full_rejects_new_path() {
        let t = RedirectTable::default();
        for i in 0..CAPACITY {
            t.add_or_renew(format!("/p{i}"), None, "a:1".into(), false, None, true, 0)
                .unwrap();
        }
        let err = t.add_or_renew("/overflow".into(), None, "a:1".into(), false, None, true, 0);
        assert!(matches!(err, Err(RedirectError::TableFull)));
    }

    #[test]
    fn hide_strips_matched_prefix() {
        let entry = Entry {
            path: "/shop".into(),
            service: None,
            target: "10.0.0.1:9000".into(),
            hide: true,
            pid: None,
            start: 0,
            expiration: 0,
        };
        let (status, location) = RedirectTable::dispatch(&entry, "/shop/cart", "id=1");
        assert_eq!(status, 301);
        assert_eq!(location, "http://10.0.0.1:9000/cart?id=1");
    }
}
