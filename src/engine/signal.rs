//! Signal generators (§3.4, §4.5.2) via the `signal-hook` self-pipe.
//!
//! `signal_callback`/`signal_handler` in `ircd_events.c` hand-roll exactly this: a
//! `pipe(2)` pair, a signal handler that writes the signal number to the write end,
//! and a readable-fd generator on the read end that drains it outside signal context.
//! `signal_hook_mio::v0_8::Signals` is that same pattern, built on the same
//! self-pipe trick, already wired up as an `mio::event::Source` — so the engine
//! registers it exactly like any other `NotSock` socket generator and never touches
//! a real signal handler directly.

use super::types::{GenFlags, GeneratorId};
use super::EventCallback;
use std::collections::HashMap;

/// One `signal_add`-style registration: "invoke this callback when `signo` fires."
pub(super) struct SignalEntry {
    pub id: GeneratorId,
    pub signo: i32,
    pub flags: GenFlags,
    /// Count of dispatches for this generator currently on the call stack.
    /// `signal_del` must not finalize the generator while this is nonzero (§3.1,
    /// §5 "Event ref invariant") — it marks `DESTROY` instead and the last
    /// in-flight dispatch to return fires the terminal event.
    pub refs: u32,
    pub callback: EventCallback,
}

/// All registered signal callbacks, grouped by signal number so one `SIGHUP`
/// delivery can fan out to every interested generator the way the original's
/// `sigInfo` array does.
#[derive(Default)]
pub(super) struct SignalTable {
    entries: HashMap<i32, Vec<SignalEntry>>,
}

impl SignalTable {
    pub fn add(&mut self, id: GeneratorId, signo: i32, callback: EventCallback) {
        self.entries.entry(signo).or_default().push(SignalEntry { id, signo, flags: GenFlags::ACTIVE, refs: 0, callback });
    }

    pub fn remove(&mut self, id: GeneratorId) -> bool {
        let mut found = false;
        self.entries.retain(|_, v| {
            let before = v.len();
            v.retain(|e| e.id != id);
            found |= v.len() != before;
            !v.is_empty()
        });
        found
    }

    /// Signal numbers any entry cares about, for constructing (or rebuilding) the
    /// underlying `Signals` source's watch set.
    pub fn watched_signals(&self) -> Vec<i32> {
        self.entries.keys().copied().collect()
    }

    /// Every callback registered for `signo`, in registration order.
    pub fn entries_for(&self, signo: i32) -> impl Iterator<Item = &SignalEntry> {
        self.entries.get(&signo).into_iter().flatten()
    }

    /// Mutable view over every registration for `signo`, used to bump `refs`
    /// before each is dispatched.
    pub fn entries_for_mut(&mut self, signo: i32) -> impl Iterator<Item = &mut SignalEntry> {
        self.entries.get_mut(&signo).into_iter().flatten()
    }

    /// Look up a single registration by generator id, regardless of signal number.
    pub fn get_mut(&mut self, id: GeneratorId) -> Option<&mut SignalEntry> {
        self.entries.values_mut().flatten().find(|e| e.id == id)
    }

    /// Look up a single registration's callback by generator id, for manual event
    /// injection (`Engine::event_generate`) rather than a live signal delivery.
    pub fn callback_for_id(&self, id: GeneratorId) -> Option<EventCallback> {
        self.entries.values().flatten().find(|e| e.id == id).map(|e| e.callback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn noop_callback() -> EventCallback {
        Rc::new(|_engine, _event| {})
    }

    #[test]
    fn fan_out_delivers_to_every_registrant_for_a_signal() {
        let mut table = SignalTable::default();
        table.add(GeneratorId(1), 1, noop_callback());
        table.add(GeneratorId(2), 1, noop_callback());
        table.add(GeneratorId(3), 2, noop_callback());

        let ids: Vec<_> = table.entries_for(1).map(|e| e.id).collect();
        assert_eq!(ids, vec![GeneratorId(1), GeneratorId(2)]);
        assert_eq!(table.entries_for(2).count(), 1);
        assert_eq!(table.entries_for(99).count(), 0);
    }

    #[test]
    fn remove_drops_entry_and_empties_signal_bucket() {
        let mut table = SignalTable::default();
        table.add(GeneratorId(1), 1, noop_callback());
        assert!(table.remove(GeneratorId(1)));
        assert_eq!(table.watched_signals().len(), 0);
        assert!(!table.remove(GeneratorId(1)), "removing twice should report false");
    }

    #[test]
    fn watched_signals_reflects_live_registrations_only() {
        let mut table = SignalTable::default();
        table.add(GeneratorId(1), 1, noop_callback());
        table.add(GeneratorId(2), 2, noop_callback());
        let mut signals = table.watched_signals();
        signals.sort();
        assert_eq!(signals, vec![1, 2]);
    }
}
