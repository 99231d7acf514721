//! Per-rank mailbox with `(source, tag)` matching.

use std::any::Any;
use std::sync::{Condvar, Mutex};

/// Message tag. Each protocol point in the engine uses its own tag so that
/// concurrent tasks blocked on different exchanges never steal each other's
/// messages. Matching is FIFO per `(source, tag)` pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tag(u64);

impl Tag {
    /// Tag layout: protocol point in bits 40.., tree level in bits 32..40,
    /// request sequence number in bits 0..32.
    pub const fn new(base: u64) -> Self {
        Self(base << 40)
    }

    /// Derives the tag of an internal sub-step of a collective.
    pub const fn next(self) -> Self {
        Self(self.0 + (1 << 32))
    }

    /// Mixes a tree level into the tag, separating per-level rounds of the
    /// same protocol point.
    pub const fn at_level(self, level: u32) -> Self {
        Self(self.0 + (((level as u64) & 0x7f) << 33))
    }

    /// Mixes a per-request sequence number into the tag, correlating a reply
    /// with its request when several are in flight.
    pub const fn seq(self, seq: u64) -> Self {
        Self(self.0 + (seq & 0xffff_ffff))
    }

    #[cfg(test)]
    pub const fn test(base: u64) -> Self {
        Self::new(0x7e57 + base)
    }
}

pub(super) struct Envelope {
    src: usize,
    tag: Tag,
    payload: Box<dyn Any + Send>,
}

impl Envelope {
    pub(super) fn new<T: Send + 'static>(src: usize, tag: Tag, value: T) -> Self {
        Self {
            src,
            tag,
            payload: Box::new(value),
        }
    }
}

/// Incoming message store of one rank. Senders push; receivers block until a
/// matching envelope arrives. Out-of-order arrivals stay buffered until some
/// receiver asks for them.
pub(super) struct Mailbox {
    pending: Mutex<Vec<Envelope>>,
    arrived: Condvar,
}

impl Mailbox {
    pub(super) fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        }
    }

    pub(super) fn push(&self, envelope: Envelope) {
        self.pending.lock().unwrap().push(envelope);
        self.arrived.notify_all();
    }

    /// Removes and returns the first envelope from `src` with `tag`,
    /// blocking until one arrives.
    pub(super) fn take<T: Send + 'static>(&self, src: usize, tag: Tag) -> T {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if let Some(pos) = pending
                .iter()
                .position(|env| env.src == src && env.tag == tag)
            {
                return Self::unpack(pending.remove(pos), src, tag);
            }
            pending = self.arrived.wait(pending).unwrap();
        }
    }

    /// Removes and returns the first envelope with `tag` from any source.
    pub(super) fn take_any<T: Send + 'static>(&self, tag: Tag) -> (usize, T) {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if let Some(pos) = pending.iter().position(|env| env.tag == tag) {
                let src = pending[pos].src;
                return (src, Self::unpack(pending.remove(pos), src, tag));
            }
            pending = self.arrived.wait(pending).unwrap();
        }
    }

    fn unpack<T: Send + 'static>(envelope: Envelope, src: usize, tag: Tag) -> T {
        *envelope
            .payload
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("type mismatch on message from rank {src} with {tag:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn out_of_order_arrivals_are_buffered() {
        let mailbox = Mailbox::new();
        mailbox.push(Envelope::new(1, Tag::test(0), 10u32));
        mailbox.push(Envelope::new(0, Tag::test(0), 20u32));
        // The rank-0 message is reachable even though rank 1's arrived first.
        assert_eq!(mailbox.take::<u32>(0, Tag::test(0)), 20);
        assert_eq!(mailbox.take::<u32>(1, Tag::test(0)), 10);
    }

    #[test]
    fn matching_is_fifo_per_source_and_tag() {
        let mailbox = Mailbox::new();
        mailbox.push(Envelope::new(0, Tag::test(0), 1u32));
        mailbox.push(Envelope::new(0, Tag::test(0), 2u32));
        assert_eq!(mailbox.take::<u32>(0, Tag::test(0)), 1);
        assert_eq!(mailbox.take::<u32>(0, Tag::test(0)), 2);
    }

    #[test]
    fn take_blocks_until_arrival() {
        let mailbox = Arc::new(Mailbox::new());
        let receiver = {
            let mailbox = mailbox.clone();
            thread::spawn(move || mailbox.take::<u32>(0, Tag::test(1)))
        };
        thread::sleep(Duration::from_millis(10));
        mailbox.push(Envelope::new(0, Tag::test(1), 42u32));
        assert_eq!(receiver.join().unwrap(), 42);
    }
}
