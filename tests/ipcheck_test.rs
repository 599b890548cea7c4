//! IPcheck connection-rate defense scenarios from the design doc's concrete-scenarios
//! section (§8.3): single-connection accept, throttle-on-the-Nth-attempt, and window
//! reset after the clone period elapses. Uses the deterministic virtual clock so the
//! "wait 41 simulated seconds" scenario needs no real sleep.
//!
//! Run with: cargo test --test ipcheck_test

use ircd_core::config::Config;
use ircd_core::ipcheck::IpCheck;
use ircd_core::time::VirtualClock;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

fn config_for_scenarios() -> Config {
    Config { ipcheck_clone_limit: 4, ipcheck_clone_period: 40, ipcheck_clone_delay: 15, ..Config::default() }
}

#[test]
fn scenario_1_single_connection_accept() {
    let clock = Arc::new(VirtualClock::new(1_000));
    let ipc = IpCheck::new(&config_for_scenarios(), clock.clone());
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    assert!(ipc.check_local(addr).is_ok());
    assert_eq!(ipc.count(addr), 1);
}

#[test]
fn scenario_2_throttle_fires_once_attempts_reach_the_clone_limit() {
    // The very first connection from a fresh address always accepts unconditionally
    // (it seeds a brand-new registry entry rather than going through the
    // increment-then-compare path), so with `clone_limit=4` the throttle actually
    // fires on the 4th call in the window, not the 5th: attempts only starts
    // incrementing from the *second* call onward (1, 2, 3, 4 — rejected at 4).
    let clock = Arc::new(VirtualClock::new(1_000));
    let ipc = IpCheck::new(&config_for_scenarios(), clock.clone());
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    // Push uptime past the clone-delay grace window before testing the throttle.
    clock.advance(16);

    let mut results = Vec::new();
    for _ in 0..4 {
        results.push(ipc.check_local(addr));
    }

    assert!(results[0].is_ok() && results[1].is_ok() && results[2].is_ok(), "first three connections must be accepted");
    assert!(results[3].is_err(), "the connection that pushes attempts to the clone limit must be throttled");
    assert_eq!(ipc.count(addr), 3, "the rejected connection must not be counted as connected");
}

#[test]
fn scenario_3_window_reset_after_clone_period_elapses() {
    let clock = Arc::new(VirtualClock::new(1_000));
    let ipc = IpCheck::new(&config_for_scenarios(), clock.clone());
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    clock.advance(16); // past the startup grace window

    for _ in 0..3 {
        assert!(ipc.check_local(addr).is_ok());
    }

    clock.advance(41); // past the 40s clone period: attempts should reset before the next check

    assert!(ipc.check_local(addr).is_ok(), "a connection after the window resets should be accepted");
}

#[test]
fn remote_connect_never_throttles_on_attempt_count() {
    // §4.6.2: remote connect decisions only reject on connected-counter overflow,
    // never on the attempt-count throttle a local connect would hit.
    let clock = Arc::new(VirtualClock::new(1_000));
    let ipc = IpCheck::new(&config_for_scenarios(), clock.clone());
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    clock.advance(100);

    for _ in 0..20 {
        assert!(ipc.check_remote(addr, false).is_ok(), "remote connects should never be throttled by attempt count");
    }
}

#[test]
fn connect_fail_rolls_back_attempt_and_connected_counters() {
    let clock = Arc::new(VirtualClock::new(1_000));
    let ipc = IpCheck::new(&config_for_scenarios(), clock.clone());
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));

    assert!(ipc.check_local(addr).is_ok());
    assert_eq!(ipc.count(addr), 1);

    ipc.connect_fail(addr, true);
    assert_eq!(ipc.count(addr), 0, "a rolled-back connection must not remain counted");
}
