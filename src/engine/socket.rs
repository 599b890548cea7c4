//! Socket generators (§3.2, §4.5.6) backed by `mio`.
//!
//! `mio::Poll` already does the backend-selection job §4.5.2 describes by hand in
//! the original (`kqueue` on BSD/macOS, `epoll` on Linux, IOCP on Windows, falling
//! back further where needed) — it picks the readiness backend for us at `Poll::new`
//! time. What this module adds on top is the generator bookkeeping the spec cares
//! about: per-socket state/mask/flags/refcount, and the state-table-driven interest
//! computation from §3.2.

use super::types::{GenFlags, Interest, MaskAction, SocketState};
use super::EventCallback;
use mio::event::Source;
use mio::{Registry, Token};
use std::io;
use std::os::unix::io::RawFd;

/// Adapts a bare, already-open file descriptor (e.g. a signal self-pipe's read
/// end) into an `mio::event::Source`, the way `SS_NOTSOCK` sockets are plain `fd`s
/// in the original rather than anything `socket(2)` produced.
pub struct RawFdSource(pub RawFd);

impl Source for RawFdSource {
    fn register(&mut self, registry: &Registry, token: Token, interests: mio::Interest) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: mio::Interest) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).deregister(registry)
    }
}

/// Translate a socket's `(state, mask)` pair into the `mio::Interest` the engine
/// should actually register, per §3.2's table. Returns `None` for sockets that
/// currently want nothing armed (a `Connected` socket with an empty mask).
pub(super) fn wanted_interest(state: SocketState, mask: Interest) -> Option<mio::Interest> {
    match state {
        SocketState::Connecting => Some(mio::Interest::WRITABLE),
        SocketState::Listening | SocketState::NotSock => Some(mio::Interest::READABLE),
        SocketState::Connected | SocketState::Datagram | SocketState::ConnectDg => {
            match (mask.contains(Interest::READABLE), mask.contains(Interest::WRITABLE)) {
                (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
                (true, false) => Some(mio::Interest::READABLE),
                (false, true) => Some(mio::Interest::WRITABLE),
                (false, false) => None,
            }
        }
    }
}

/// A socket generator: the engine's view of one registered file descriptor.
pub(super) struct Socket {
    pub token: Token,
    pub source: Box<dyn Source + Send>,
    pub state: SocketState,
    pub mask: Interest,
    pub flags: GenFlags,
    pub refs: u32,
    pub callback: EventCallback,
}

impl Socket {
    pub fn new(token: Token, source: Box<dyn Source + Send>, state: SocketState, mask: Interest, callback: EventCallback) -> Self {
        Self { token, source, state, mask, flags: GenFlags::ACTIVE, refs: 0, callback }
    }

    pub fn is_destroying(&self) -> bool {
        self.flags.contains(GenFlags::DESTROY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_table_matches_spec_3_2() {
        assert_eq!(wanted_interest(SocketState::Connecting, Interest::empty()), Some(mio::Interest::WRITABLE));
        assert_eq!(wanted_interest(SocketState::Listening, Interest::empty()), Some(mio::Interest::READABLE));
        assert_eq!(wanted_interest(SocketState::NotSock, Interest::empty()), Some(mio::Interest::READABLE));
        assert_eq!(wanted_interest(SocketState::Connected, Interest::empty()), None);
        assert_eq!(
            wanted_interest(SocketState::Connected, Interest::READABLE | Interest::WRITABLE),
            Some(mio::Interest::READABLE | mio::Interest::WRITABLE)
        );
        assert_eq!(wanted_interest(SocketState::Datagram, Interest::WRITABLE), Some(mio::Interest::WRITABLE));
    }

    #[test]
    fn mask_action_set_add_del_compose_as_spec_expects() {
        let mut mask = Interest::empty();
        mask = MaskAction::Add.apply(mask, Interest::READABLE);
        assert_eq!(mask, Interest::READABLE);
        mask = MaskAction::Add.apply(mask, Interest::WRITABLE);
        assert_eq!(mask, Interest::READABLE | Interest::WRITABLE);
        mask = MaskAction::Del.apply(mask, Interest::READABLE);
        assert_eq!(mask, Interest::WRITABLE);
        mask = MaskAction::Set.apply(mask, Interest::empty());
        assert_eq!(mask, Interest::empty());
    }
}
