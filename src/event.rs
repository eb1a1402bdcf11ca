//! Typed multicast event channel.
//!
//! Subscribers are invoked synchronously, in registration order, on the
//! thread that calls [`Event::emit`]. A slow subscriber slows down whatever
//! emitted the event; the factorization engines emit from inside their main
//! loop.

use std::fmt;

/// Handle returned by [`Event::connect`], used to disconnect later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Callback<A> = Box<dyn FnMut(A) + Send + Sync>;

pub struct Event<A> {
    subscribers: Vec<(SubscriberId, Callback<A>)>,
    next_id: u64,
}

impl<A> Default for Event<A> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 0,
        }
    }
}

impl<A> fmt::Debug for Event<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl<A: Copy> Event<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&mut self, callback: F) -> SubscriberId
    where
        F: FnMut(A) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Remove one subscriber. Returns false if `id` was not connected.
    pub fn disconnect(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub fn is_connected(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn emit(&mut self, args: A) {
        for (_, callback) in self.subscribers.iter_mut() {
            callback(args);
        }
    }
}
