//! Priority-ordered event hooks for per-kind object lifecycles (§4.4).
//!
//! Ported from `include/watch.h`: a named [`WatchTable`] holds a priority-ordered
//! list of [`Watch`] handlers, each interested in a bitmask of events. Handlers run
//! lowest-priority-first and any handler may short-circuit the rest by returning
//! non-zero, exactly as `watch_event`'s `wat_call` contract specifies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Built-in event: an object of the watched kind was created.
pub const EV_CREATE: u32 = 0;
/// Built-in event: an object of the watched kind is being destroyed.
pub const EV_DESTROY: u32 = 1;
/// First id available for module-defined events.
pub const EV_USER_MIN: u32 = 2;
/// Last id available for module-defined events.
pub const EV_USER_MAX: u32 = 31;

/// Lowest legal priority; handlers at this priority run first.
pub const PRIO_MIN: u32 = 0;
/// Highest legal priority; handlers at this priority run last.
pub const PRIO_MAX: u32 = 10_000;

/// Turn an event id into its bit within a [`watch mask`](Watch::mask).
pub const fn event_bit(ev: u32) -> u64 {
    1u64 << ev
}

/// A single registered handler.
///
/// The callback receives the firing event, an opaque object reference, and an opaque
/// extra-data reference, and returns `true` to stop further handlers in the table
/// from running for this event (mirroring `watchcall_t`'s "non-zero stops processing").
pub struct Watch {
    priority: u32,
    mask: u64,
    callback: Arc<dyn Fn(u32, &dyn std::any::Any, &dyn std::any::Any) -> bool + Send + Sync>,
}

impl Watch {
    pub fn new(
        priority: u32,
        mask: u64,
        callback: Arc<dyn Fn(u32, &dyn std::any::Any, &dyn std::any::Any) -> bool + Send + Sync>,
    ) -> Self {
        let priority = priority.clamp(PRIO_MIN, PRIO_MAX);
        Self { priority, mask, callback }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    fn interested_in(&self, event: u32) -> bool {
        self.mask & event_bit(event) != 0
    }
}

/// One named table of watches for a particular kind of object (e.g. "users").
#[derive(Default)]
struct WatchTable {
    watches: Vec<Arc<Watch>>,
}

impl WatchTable {
    /// Insert keeping the list sorted by priority, ties broken by insertion order
    /// (insert before the first entry whose priority is strictly greater).
    fn insert(&mut self, watch: Arc<Watch>) {
        let pos = self.watches.iter().position(|w| w.priority > watch.priority).unwrap_or(self.watches.len());
        self.watches.insert(pos, watch);
    }

    fn remove(&mut self, watch: &Arc<Watch>) -> bool {
        if let Some(pos) = self.watches.iter().position(|w| Arc::ptr_eq(w, watch)) {
            self.watches.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Registry of named watch tables (mirrors the `"watches"` registration table the
/// original bootstraps each `WatchTab` into).
#[derive(Default)]
pub struct WatchRegistry {
    tables: Mutex<HashMap<String, WatchTable>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<R>(&self, table: &str, f: impl FnOnce(&mut WatchTable) -> R) -> R {
        let mut tables = self.tables.lock().unwrap();
        let t = tables.entry(table.to_string()).or_default();
        f(t)
    }

    /// Add a watch to the named table, creating the table if this is its first watch.
    pub fn add(&self, table: &str, watch: Arc<Watch>) {
        self.with_table(table, |t| t.insert(watch));
    }

    /// Remove a watch from the named table. No-op if not present.
    pub fn remove(&self, table: &str, watch: &Arc<Watch>) -> bool {
        self.with_table(table, |t| t.remove(watch))
    }

    /// Fire `event` on `table`'s watch list, lowest priority first. Stops at the
    /// first handler that returns `true`.
    pub fn fire(&self, table: &str, event: u32, obj: &dyn std::any::Any, extra: &dyn std::any::Any) {
        let watches: Vec<Arc<Watch>> = {
            let tables = self.tables.lock().unwrap();
            match tables.get(table) {
                Some(t) => t.watches.clone(),
                None => return,
            }
        };
        for watch in watches {
            if watch.interested_in(event) && (watch.callback)(event, obj, extra) {
                break;
            }
        }
    }

    /// Remove every watch from a table, leaving the (now-empty) table in place.
    pub fn flush(&self, table: &str) {
        self.with_table(table, |t| t.watches.clear());
    }

    pub fn count(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.get(table).map(|t| t.watches.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fires_in_priority_order() {
        let registry = WatchRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, prio) in [("c", 300u32), ("a", 100u32), ("b", 200u32)] {
            let order = order.clone();
            let name = name.to_string();
            registry.add(
                "users",
                Arc::new(Watch::new(
                    prio,
                    event_bit(EV_CREATE),
                    Arc::new(move |_ev, _obj, _extra| {
                        order.lock().unwrap().push(name.clone());
                        false
                    }),
                )),
            );
        }

        registry.fire("users", EV_CREATE, &(), &());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn stopping_handler_short_circuits_remaining() {
        let registry = WatchRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));

        let c1 = calls.clone();
        registry.add(
            "users",
            Arc::new(Watch::new(0, event_bit(EV_DESTROY), Arc::new(move |_, _, _| {
                c1.fetch_add(1, Ordering::SeqCst);
                true
            }))),
        );
        let c2 = calls.clone();
        registry.add(
            "users",
            Arc::new(Watch::new(10, event_bit(EV_DESTROY), Arc::new(move |_, _, _| {
                c2.fetch_add(1, Ordering::SeqCst);
                false
            }))),
        );

        registry.fire("users", EV_DESTROY, &(), &());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mask_filters_uninterested_watches() {
        let registry = WatchRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        registry.add(
            "users",
            Arc::new(Watch::new(0, event_bit(EV_CREATE), Arc::new(move |_, _, _| {
                c.fetch_add(1, Ordering::SeqCst);
                false
            }))),
        );
        registry.fire("users", EV_DESTROY, &(), &());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn flush_removes_all_watches() {
        let registry = WatchRegistry::new();
        registry.add("users", Arc::new(Watch::new(0, event_bit(EV_CREATE), Arc::new(|_, _, _| false))));
        assert_eq!(registry.count("users"), 1);
        registry.flush("users");
        assert_eq!(registry.count("users"), 0);
    }

    #[test]
    fn remove_specific_watch() {
        let registry = WatchRegistry::new();
        let watch = Arc::new(Watch::new(0, event_bit(EV_CREATE), Arc::new(|_, _, _| false)));
        registry.add("users", watch.clone());
        assert!(registry.remove("users", &watch));
        assert_eq!(registry.count("users"), 0);
    }
}
