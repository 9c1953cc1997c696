//! End-to-end scenarios exercising the redirection table, peer gossip,
//! depot convergence, client port mapping and signing together, the
//! way a registration + a lease lapse + a config reload would actually
//! play out in one process.

use client::{advertised_target, PortMap};
use codec::{KeySet, Message, PeerEntry, SignMethod};
use depot::{CacheEntry, DepotClient};
use portal::peers::PeerTable;
use portal::redirect::{RedirectTable, LEASE_SECONDS};

/// S1: a service registers a path, a client request to that path
/// resolves and dispatches to the registered target with a 302 (it's a
/// live lease, not permanent).
#[test]
fn service_registers_and_client_is_redirected() {
    let table = RedirectTable::default();
    table
        .add_or_renew("/shop".into(), Some("shop".into()), "10.0.0.5:9100".into(), false, Some(4242), true, 0)
        .unwrap();

    let entry = table.resolve("/shop/cart").expect("should resolve under registered prefix");
    let (status, location) = RedirectTable::dispatch(&entry, "/shop/cart", "id=7");
    assert_eq!(status, 302);
    assert_eq!(location, "http://10.0.0.5:9100/shop/cart?id=7");
}

/// S2: a lease that isn't renewed lapses and is reaped exactly once;
/// the path then falls through to 404.
#[test]
fn unrenewed_lease_lapses_and_is_reaped() {
    let table = RedirectTable::default();
    table.add_or_renew("/shop".into(), None, "10.0.0.5:9100".into(), false, None, true, 0).unwrap();

    assert!(table.resolve("/shop").is_some());

    let removed = table.reap(LEASE_SECONDS + 1);
    assert_eq!(removed, vec!["/shop".to_string()]);
    assert!(table.resolve("/shop").is_none());

    // a second reap finds nothing left to remove
    assert!(table.reap(LEASE_SECONDS + 2).is_empty());
}

/// S3: a permanent route loaded from static config survives arbitrary
/// live-registration churn, but a config reload that no longer lists
/// it deprecates and then reaps it.
#[test]
fn permanent_route_outlives_churn_but_not_a_reload_that_drops_it() {
    let table = RedirectTable::default();
    table.add_or_renew("/admin".into(), None, "10.0.0.1:9000".into(), false, None, false, 0).unwrap();

    for _ in 0..5 {
        table.add_or_renew("/admin".into(), None, "10.0.0.9:9999".into(), false, Some(1), true, 100).unwrap();
    }
    assert_eq!(table.resolve("/admin").unwrap().expiration, 0);

    // simulating a config reload that no longer declares /admin
    table.deprecate_all();
    let removed = table.reap(i64::MAX);
    assert_eq!(removed, vec!["/admin".to_string()]);
}

/// S4: a peer's lease lapses (PEER/EXPIRE), then a fresher gossip
/// packet brings it back (PEER/RECOVER), and a static peer is immune
/// to either transition.
#[test]
fn peer_expires_and_recovers_while_static_peer_is_unaffected() {
    let peers = PeerTable::default();
    peers.add_static("static-host".into());
    peers.learn(PeerEntry { host: "dyn-host".into(), expiration: Some(50) }, 0);

    let expired = peers.expire(60);
    assert_eq!(expired, vec!["dyn-host".to_string()]);

    let recovered = peers.learn(PeerEntry { host: "dyn-host".into(), expiration: Some(200) }, 60);
    assert!(recovered);

    let static_entry = peers.list().into_iter().find(|p| p.host == "static-host").unwrap();
    assert_eq!(static_entry.expiration, 0);
    assert!(peers.expire(1_000_000).iter().all(|h| h != "static-host"));
}

/// S5: an undelivered depot entry adopts whichever replica reports the
/// highest timestamp first, then keeps following that replica even
/// backward, and only fails over to another replica once the chosen
/// one has been silent for longer than the 180s failover window.
#[test]
fn depot_entry_converges_then_follows_chosen_host_then_fails_over() {
    let mut entry = CacheEntry::fresh("config", "theme");

    // Two replicas report before anything is delivered: the higher
    // timestamp wins regardless of arrival order.
    DepotClient::converge(&mut entry, "d1.lan:80", 100, 1_000);
    DepotClient::converge(&mut entry, "d2.lan:80", 150, 1_000);
    assert_eq!(entry.host(), Some("d2.lan:80"));
    assert_eq!(entry.detected(), 150);

    // d2 is now the chosen host; even a backward timestamp from it is
    // followed, since it's the authority for this key.
    DepotClient::converge(&mut entry, "d2.lan:80", 90, 1_050);
    assert_eq!(entry.detected(), 90);

    // d1 reports a higher timestamp, but d2 has only been silent 10s —
    // well under the 180s failover window, so d1 is ignored.
    DepotClient::converge(&mut entry, "d1.lan:80", 999, 1_060);
    assert_eq!(entry.host(), Some("d2.lan:80"));

    // d2 has now been silent 200s: d1 takes over.
    DepotClient::converge(&mut entry, "d1.lan:80", 999, 1_250);
    assert_eq!(entry.host(), Some("d1.lan:80"));
    assert_eq!(entry.detected(), 999);
}

/// S6: a registering client rewrites its advertised port through
/// `-portal-map=EXT:INT` before the Portal or any browser ever sees
/// it, and includes its own hostname only when the Portal it's
/// registering with isn't on the same host.
#[test]
fn port_map_rewrites_advertised_target_for_remote_and_local_portals() {
    let maps = [PortMap::parse("8443:9443").unwrap()];

    // Same-host portal: no hostname, just the rewritten port.
    assert_eq!(advertised_target(None, 9443, &maps), "8443");

    // Remote portal: hostname plus the rewritten port.
    assert_eq!(advertised_target(Some("attic.lan"), 9443, &maps), "attic.lan:8443");

    // A webport with no matching map entry passes through unchanged.
    assert_eq!(advertised_target(Some("attic.lan"), 9000, &maps), "attic.lan:9000");
}

/// S7: signed control traffic round-trips through the wire codec, and
/// a tampered payload is rejected without touching any state.
#[test]
fn signed_redirect_round_trips_and_tampering_is_rejected() {
    let mut keys = KeySet::default();
    keys.push(SignMethod::Sha256, "00112233445566778899aabbccddeeff").unwrap();

    let msg = Message::Redirect {
        timestamp: Some(1_700_000_000),
        target: "10.0.0.5:9100".into(),
        hide: false,
        pid: Some(99),
        paths: vec![codec::PathEntry { service: Some("shop".into()), path: "/shop".into() }],
    };

    let line = keys.sign(&msg.to_string());
    let body = keys.verify(&line).expect("signature should verify");
    assert_eq!(Message::parse(body).unwrap(), msg);

    let tampered = line.replace("9100", "9999");
    assert!(keys.verify(&tampered).is_err());
}

/// S8: a redirection table enforces its capacity rather than growing
/// unbounded when a misbehaving or runaway registrant floods it.
#[test]
fn table_capacity_is_enforced_under_registration_flood() {
    let table = RedirectTable::default();
    for i in 0..128 {
        table
            .add_or_renew(format!("/flood-{i}"), None, "10.0.0.1:1".into(), false, None, true, 0)
            .unwrap();
    }

    let result = table.add_or_renew("/one-too-many".into(), None, "10.0.0.1:1".into(), false, None, true, 0);
    assert!(result.is_err());
    assert_eq!(table.list().len(), 128);
}
