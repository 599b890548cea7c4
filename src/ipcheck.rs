//! Per-address connection-rate defense and free-target credit tracking (§4.6.2-3).
//!
//! Ported from `ircd/IPcheck.c`. Two registries are kept: one keyed by a canonical
//! per-client address (6to4-mapped IPv4, or the IPv6 /64 prefix) tracking connection
//! counts and attempt history, and a coarser one keyed by the IPv6 /48 aggregate that
//! catches clone farms spread across a single allocation. Both use saturating
//! counters — the original detects overflow by watching an unsigned counter wrap to
//! zero; we get the same "stop, don't corrupt state" behavior from `checked_add`.

use crate::error::{CoreError, CoreResult};
use crate::time::{rolling16, since_rolling16, Clock};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// Canonicalize an address the way `ip_registry_canonicalize` does: IPv4 addresses
/// (and IPv4-mapped ones) become a `0x2002:hi:lo` triple, IPv6 addresses keep their
/// first four segments (/64 prefix). The fourth word is always zero, matching the
/// original zeroing `in6_16[3]` on the IPv4 path and `in6_16[4..8]` generally.
fn canonicalize(addr: IpAddr) -> [u16; 4] {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            [0x2002, u16::from_be_bytes([o[0], o[1]]), u16::from_be_bytes([o[2], o[3]]), 0]
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            [s[0], s[1], s[2], s[3]]
        }
    }
}

fn is_valid(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => !v4.is_unspecified(),
        IpAddr::V6(v6) => !v6.is_unspecified(),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    last_connect: u16,
    connected: u16,
    attempts: u8,
    /// Free-target credit remaining, once known (absent means "never computed yet,
    /// assume the configured starting allowance").
    free_targets: Option<u32>,
}

impl Entry {
    fn new(now: u64) -> Self {
        Self { last_connect: rolling16(now), connected: 1, attempts: 1, free_targets: None }
    }

    /// Recompute free-target credit from elapsed time since the last attempt, capped
    /// at the configured starting allowance (`ip_registry_update_free_targets`).
    fn update_free_targets(&mut self, now: u64, target_delay: u64, start_targets: u32) -> u32 {
        match self.free_targets {
            Some(count) => {
                let elapsed = since_rolling16(now, self.last_connect) as u64;
                let regained = (elapsed / target_delay.max(1)) as u32;
                let total = (count + regained).min(start_targets);
                self.free_targets = Some(total);
                total
            }
            None => start_targets,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry48 {
    last_connect: u16,
    attempts: u16,
}

/// Snapshot handed back on a successful connection, for the caller to report however
/// it likes (the original formats this straight into a NOTICE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connected: u16,
    pub attempts: u8,
    pub clone_limit: u32,
    pub free_targets: u32,
    pub start_targets: u32,
}

/// Bookkeeping about a disconnecting local client needed to compute its free-target
/// bonus; lives on the client object in the embedding crate.
#[derive(Debug, Clone, Copy)]
pub struct LocalClientStats {
    /// Absolute time the client is next permitted to message a fresh target.
    pub next_target: u64,
    /// Absolute time the client first connected.
    pub first_connect: u64,
}

/// Connection-rate defense and free-target credit registry.
pub struct IpCheck {
    clock: Arc<dyn Clock>,
    started_at: u64,
    clone_limit: u32,
    clone_period: u64,
    clone_48_limit: u32,
    clone_48_period: u64,
    clone_delay: u64,
    start_targets: u32,
    target_delay: u64,
    entries: Mutex<HashMap<[u16; 4], Entry>>,
    entries48: Mutex<HashMap<[u16; 3], Entry48>>,
}

impl IpCheck {
    pub fn new(config: &crate::config::Config, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            started_at,
            clone_limit: config.ipcheck_clone_limit,
            clone_period: config.ipcheck_clone_period,
            clone_48_limit: config.ipcheck_48_clone_limit,
            clone_48_period: config.ipcheck_48_clone_period,
            clone_delay: config.ipcheck_clone_delay,
            start_targets: config.start_targets as u32,
            target_delay: config.target_delay,
            entries: Mutex::new(HashMap::new()),
            entries48: Mutex::new(HashMap::new()),
        }
    }

    fn uptime_past_grace(&self, now: u64) -> bool {
        now.saturating_sub(self.started_at) > self.clone_delay
    }

    /// Bump the /48 attempt counter for an IPv6 address, resetting it first if the
    /// clone-period window has elapsed. Returns the post-bump attempt count.
    fn bump_48(&self, canon: [u16; 4], now: u64) -> u16 {
        let mut entries48 = self.entries48.lock().unwrap();
        let e48 = entries48
            .entry([canon[0], canon[1], canon[2]])
            .or_insert_with(|| Entry48 { last_connect: rolling16(now), attempts: 0 });
        if since_rolling16(now, e48.last_connect) as u64 > self.clone_48_period {
            e48.attempts = 0;
        }
        e48.last_connect = rolling16(now);
        e48.attempts = e48.attempts.saturating_add(1);
        e48.attempts
    }

    /// Check whether a new local connection from `addr` should be allowed. On
    /// acceptance, returns the absolute time at which another free target is granted.
    pub fn check_local(&self, addr: IpAddr) -> CoreResult<u64> {
        let now = self.clock.now();
        let canon = canonicalize(addr);

        if let IpAddr::V6(_) = addr {
            let attempts = self.bump_48(canon, now);
            if attempts as u32 >= self.clone_48_limit && self.uptime_past_grace(now) {
                let mut entries = self.entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(&canon) {
                    entry.last_connect = rolling16(now);
                }
                return Err(CoreError::ConnectionThrottled);
            }
        }

        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(&canon) {
            entries.insert(canon, Entry::new(now));
            return Ok(now + self.target_delay * self.start_targets as u64);
        }
        let entry = entries.get_mut(&canon).unwrap();

        entry.connected = entry.connected.checked_add(1).ok_or(CoreError::CounterOverflow)?;

        if since_rolling16(now, entry.last_connect) as u64 > self.clone_period {
            entry.attempts = 0;
        }

        let free_targets = entry.update_free_targets(now, self.target_delay, self.start_targets);
        entry.last_connect = rolling16(now);
        entry.attempts = entry.attempts.saturating_add(1);

        let next_target = now.saturating_sub(self.target_delay.saturating_mul(free_targets as u64)).saturating_add(1);

        if (entry.attempts as u32) < self.clone_limit {
            Ok(next_target)
        } else if self.uptime_past_grace(now) {
            entry.connected -= 1;
            Err(CoreError::ConnectionThrottled)
        } else {
            Ok(next_target)
        }
    }

    /// Check whether a remote (burst-introduced or relayed) client should be
    /// accepted. Far more permissive than [`Self::check_local`]: the only rejection
    /// cause is the connection counter overflowing.
    pub fn check_remote(&self, addr: IpAddr, is_burst: bool) -> CoreResult<()> {
        if !is_valid(addr) {
            return Ok(());
        }
        let now = self.clock.now();
        let canon = canonicalize(addr);

        if let IpAddr::V6(_) = addr {
            self.bump_48(canon, now);
        }

        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(&canon) {
            let mut entry = Entry::new(now);
            if is_burst {
                entry.attempts = 0;
            }
            entries.insert(canon, entry);
            return Ok(());
        }
        let entry = entries.get_mut(&canon).unwrap();
        entry.connected = entry.connected.checked_add(1).ok_or(CoreError::CounterOverflow)?;
        if since_rolling16(now, entry.last_connect) as u64 > self.clone_period {
            entry.attempts = 0;
        }
        if !is_burst {
            entry.attempts = entry.attempts.saturating_add(1);
            entry.update_free_targets(now, self.target_delay, self.start_targets);
            entry.last_connect = rolling16(now);
        }
        Ok(())
    }

    /// Undo the effect of a [`Self::check_local`] acceptance when the connection was
    /// subsequently rejected for an unrelated reason (bad password, banned, etc).
    pub fn connect_fail(&self, addr: IpAddr, disconnect: bool) {
        let canon = canonicalize(addr);
        if let IpAddr::V6(_) = addr {
            let mut entries48 = self.entries48.lock().unwrap();
            if let Some(e48) = entries48.get_mut(&[canon[0], canon[1], canon[2]]) {
                e48.attempts = e48.attempts.saturating_sub(1).max(1);
            }
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&canon) {
            entry.attempts = entry.attempts.saturating_sub(1).max(1);
            if disconnect {
                entry.connected = entry.connected.saturating_sub(1);
            }
        }
    }

    /// Snapshot an address's registry entry right after a successful connection.
    pub fn connect_succeeded(&self, addr: IpAddr) -> Option<ConnectionSnapshot> {
        let entries = self.entries.lock().unwrap();
        entries.get(&canonicalize(addr)).map(|e| ConnectionSnapshot {
            connected: e.connected,
            attempts: e.attempts,
            clone_limit: self.clone_limit,
            free_targets: e.free_targets.unwrap_or(self.start_targets),
            start_targets: self.start_targets,
        })
    }

    /// Record a client disconnecting, donating its leftover target credit back to
    /// the address entry via pointwise minimum (so the next connection from that
    /// address never gets *more* credit than the best-behaved recent client left).
    pub fn disconnect(&self, addr: IpAddr, stats: LocalClientStats) {
        if !is_valid(addr) {
            return;
        }
        let now = self.clock.now();
        let canon = canonicalize(addr);
        let mut entries = self.entries.lock().unwrap();
        let entry = match entries.get_mut(&canon) {
            Some(e) => e,
            None => return,
        };

        entry.connected = entry.connected.saturating_sub(1);
        if entry.connected == 0 {
            if since_rolling16(now, entry.last_connect) as u64 > self.clone_limit as u64 * self.clone_period {
                entry.attempts = 0;
            }
            entry.update_free_targets(now, self.target_delay, self.start_targets);
            entry.last_connect = rolling16(now);
        }

        let mut free_targets = if stats.next_target < now {
            ((now - stats.next_target) / self.target_delay.max(1)) as u32 + 1
        } else {
            0
        };
        if now.saturating_sub(stats.first_connect) > 600 {
            free_targets += ((now - stats.first_connect - 600) / self.target_delay.max(1)) as u32;
        }

        let count = entry.free_targets.get_or_insert(self.start_targets);
        if free_targets < *count {
            *count = free_targets;
        }
    }

    pub fn count(&self, addr: IpAddr) -> u16 {
        self.entries.lock().unwrap().get(&canonicalize(addr)).map(|e| e.connected).unwrap_or(0)
    }

    /// Periodic sweep (nominally every 60s, per `IPcheck_init`'s timer): fully expire
    /// unconnected entries idle more than 600s, and drop just the target credit on
    /// ones idle more than 120s. /48 entries expire outright after 600s idle.
    pub fn expire_sweep(&self) {
        let now = self.clock.now();
        self.entries.lock().unwrap().retain(|_, entry| {
            if entry.connected != 0 {
                return true;
            }
            let idle = since_rolling16(now, entry.last_connect) as u64;
            if idle > 600 {
                return false;
            }
            if idle > 120 {
                entry.free_targets = None;
            }
            true
        });
        self.entries48.lock().unwrap().retain(|_, e48| since_rolling16(now, e48.last_connect) as u64 <= 600);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::time::VirtualClock;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn fresh(clock: Arc<VirtualClock>) -> IpCheck {
        IpCheck::new(&Config::default(), clock)
    }

    #[test]
    fn first_connection_from_address_is_always_accepted() {
        let clock = Arc::new(VirtualClock::new(1_000_000));
        let ipc = fresh(clock);
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));
        assert!(ipc.check_local(addr).is_ok());
        assert_eq!(ipc.count(addr), 1);
    }

    #[test]
    fn repeated_fast_connections_are_throttled_after_grace_period() {
        let clock = Arc::new(VirtualClock::new(1_000_000));
        let ipc = fresh(clock.clone());
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));

        // Push uptime well past the clone-delay grace window first.
        clock.advance(100);

        let mut rejected_at = None;
        for i in 0..10 {
            let res = ipc.check_local(addr);
            if res.is_err() {
                rejected_at = Some(i);
                break;
            }
            clock.advance(1);
        }
        assert!(rejected_at.is_some(), "clone limit should eventually throttle rapid reconnections");
    }

    #[test]
    fn grace_period_prevents_throttling_right_after_startup() {
        let clock = Arc::new(VirtualClock::new(0));
        let ipc = fresh(clock.clone());
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        for _ in 0..20 {
            assert!(ipc.check_local(addr).is_ok(), "still within grace period, should never reject");
        }
    }

    #[test]
    fn connect_fail_undoes_attempt_penalty() {
        let clock = Arc::new(VirtualClock::new(1_000_000));
        let ipc = fresh(clock);
        let addr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9));
        ipc.check_local(addr).unwrap();
        ipc.connect_fail(addr, true);
        assert_eq!(ipc.count(addr), 0);
    }

    #[test]
    fn ipv6_48_block_canonicalization_collapses_same_prefix() {
        let clock = Arc::new(VirtualClock::new(1_000_000));
        let ipc = fresh(clock);
        let a = IpAddr::V6("2001:db8:1::1".parse::<Ipv6Addr>().unwrap());
        let b = IpAddr::V6("2001:db8:1::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(canonicalize(a), canonicalize(b), "same /64 prefix must canonicalize identically");
    }

    #[test]
    fn disconnect_donates_minimum_free_targets() {
        let clock = Arc::new(VirtualClock::new(1_000_000));
        let ipc = fresh(clock.clone());
        let addr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 44));
        ipc.check_local(addr).unwrap();
        ipc.disconnect(addr, LocalClientStats { next_target: 1_000_000, first_connect: 999_000 });
        let snap = ipc.connect_succeeded(addr);
        assert!(snap.is_some());
    }

    #[test]
    fn expire_sweep_removes_long_idle_unconnected_entries() {
        let clock = Arc::new(VirtualClock::new(1_000_000));
        let ipc = fresh(clock.clone());
        let addr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 55));
        ipc.check_local(addr).unwrap();
        ipc.disconnect(addr, LocalClientStats { next_target: 1_000_000, first_connect: 999_000 });
        clock.advance(700);
        ipc.expire_sweep();
        assert_eq!(ipc.count(addr), 0);
    }
}
