//! Timer generators and the single ordered-by-expiry timer queue (§3.3, §4.5.4).
//!
//! Ported from `timer_enqueue`/`timer_run` in `ircd_events.c`. The original keeps
//! timers on an intrusive singly linked list sorted by `t_expire`; we use a `Vec`
//! kept sorted the same way (insertion position found the same linear-scan way the
//! C does it) since the queue is expected to stay small and the re-sort-on-rearm
//! requirement rules out a simple binary heap (re-arming a non-periodic timer to an
//! earlier time needs the *old* entry removed, which a `BinaryHeap` can't do without
//! a full rebuild anyway).

use super::types::{Event, EventKind, GenFlags, GeneratorHandle, GeneratorId};
use super::EventCallback;

/// The three timer flavors from §3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Absolute,
    Relative,
    Periodic,
}

pub(super) struct TimerEntry {
    pub id: GeneratorId,
    pub flags: GenFlags,
    /// Count of dispatches for this generator currently on the call stack. Only
    /// ever 0 or 1 in practice (timers fire one at a time), but kept uniform with
    /// [`super::socket::Socket`] and [`super::signal::SignalEntry`] so `timer_del`
    /// follows the same ref-checked deferral rule (§3.1, §5 "Event ref invariant").
    pub refs: u32,
    pub kind: TimerKind,
    /// For `Relative`/`Periodic`, the seconds offset used to recompute `expire_at`
    /// each time the timer (re-)enqueues; for `Absolute`, the target time itself.
    pub value: u64,
    pub expire_at: u64,
    pub callback: EventCallback,
}

impl TimerEntry {
    fn compute_expiry(kind: TimerKind, value: u64, now: u64) -> u64 {
        match kind {
            TimerKind::Absolute => value,
            TimerKind::Relative | TimerKind::Periodic => now.saturating_add(value),
        }
    }
}

/// The engine's single ordered timer list (`evInfo.gens.g_timer`).
#[derive(Default)]
pub(super) struct TimerQueue {
    // Ascending by `expire_at`; head (index 0) is next to fire.
    entries: Vec<TimerEntry>,
}

impl TimerQueue {
    fn insert_sorted(&mut self, entry: TimerEntry) {
        let pos = self.entries.iter().position(|e| entry.expire_at < e.expire_at).unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    /// Arm (or re-arm) a timer, computing its absolute expiry from `now`.
    pub fn enqueue(&mut self, id: GeneratorId, kind: TimerKind, value: u64, now: u64, callback: EventCallback) {
        let expire_at = TimerEntry::compute_expiry(kind, value, now);
        self.insert_sorted(TimerEntry { id, flags: GenFlags::ACTIVE, refs: 0, kind, value, expire_at, callback });
    }

    /// Remove a timer from the queue without firing it (used by `timer_del` and as
    /// the first half of `timer_chg`). Returns the removed entry, if present.
    pub fn remove(&mut self, id: GeneratorId) -> Option<TimerEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Change an inactive timer's type/value and re-sort it into place
    /// (`timer_chg`). No-op if the timer isn't currently queued (e.g. it's
    /// `MARKED`, mid-callback — the original also forbids changing a firing timer).
    pub fn change(&mut self, id: GeneratorId, kind: TimerKind, value: u64, now: u64) -> bool {
        if let Some(mut entry) = self.remove(id) {
            entry.kind = kind;
            entry.value = value;
            entry.expire_at = TimerEntry::compute_expiry(kind, value, now);
            self.insert_sorted(entry);
            true
        } else {
            false
        }
    }

    pub fn next_expiry(&self) -> Option<u64> {
        self.entries.first().map(|e| e.expire_at)
    }

    /// Pop the head if it has expired by `now`.
    pub fn pop_expired(&mut self, now: u64) -> Option<TimerEntry> {
        if self.entries.first().map(|e| e.expire_at <= now).unwrap_or(false) {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    /// Re-enqueue a periodic (or explicitly re-armed) timer after it fires.
    pub fn requeue(&mut self, mut entry: TimerEntry, now: u64) {
        entry.expire_at = TimerEntry::compute_expiry(entry.kind, entry.value, now);
        self.insert_sorted(entry);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].expire_at <= w[1].expire_at)
    }
}

/// Run every timer whose expiry is `<= now`, invoking `dispatch` with an `Expire`
/// event for each and, unless it re-arms itself (`READD`), a trailing `Destroy`
/// (§4.5.4). `dispatch` is responsible for actually calling the timer's callback
/// and reporting back whether it asked to be kept alive (periodic timers always
/// are; one-shot timers are kept only if the callback itself re-armed them, which
/// `dispatch` detects via the re-queue call made from inside the callback).
pub(super) fn run_expired(
    queue: &mut TimerQueue,
    now: u64,
    mut dispatch: impl FnMut(GeneratorId, &EventCallback, Event),
) {
    while let Some(mut entry) = queue.pop_expired(now) {
        entry.flags |= GenFlags::MARKED;
        if entry.kind == TimerKind::Periodic {
            entry.flags |= GenFlags::READD;
        }

        let event = Event { kind: EventKind::Expire, generator: GeneratorHandle::Timer(entry.id), data: 0 };
        dispatch(entry.id, &entry.callback, event);

        entry.flags.remove(GenFlags::MARKED);

        if entry.flags.contains(GenFlags::READD) {
            entry.flags.remove(GenFlags::READD);
            queue.requeue(entry, now);
        } else {
            let destroy = Event { kind: EventKind::Destroy, generator: GeneratorHandle::Timer(entry.id), data: 0 };
            dispatch(entry.id, &entry.callback, destroy);
        }
    }
}
