//! # confab-subpub
//!
//! Index-keyed publish/subscribe for streaming snapshots to many
//! concurrent subscribers.
//!
//! ## Overview
//!
//! A [`SubPub`] carries values tagged with a monotonically increasing
//! index (for conversations, the message sequence id). Subscribers join
//! with the last index they have already seen and receive only values
//! published with a greater index, in publication order. A slow
//! subscriber never stalls the publisher: each subscriber owns a small
//! bounded mailbox, and one that would block a delivery is disconnected
//! instead.
//!
//! ## Quick Start
//!
//! ```rust
//! use confab_subpub::SubPub;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let bus: SubPub<String> = SubPub::new();
//!
//! let token = CancellationToken::new();
//! let mut sub = bus.subscribe(&token, -1);
//!
//! bus.publish(0, "hello".to_string());
//! assert_eq!(sub.next().await, Some("hello".to_string()));
//! # }
//! ```
//!
//! ## Semantics
//!
//! - `publish(idx, v)` delivers to every subscriber whose index is less
//!   than `idx` and advances it to `idx`. Subscribers already at or past
//!   `idx` are left untouched.
//! - `broadcast(v)` delivers to every subscriber without advancing any
//!   index. Used for out-of-band notifications such as conversation-list
//!   updates.
//! - A subscriber whose mailbox is full at delivery time is behind: its
//!   mailbox is closed, its cancellation token fired, and it is removed.
//! - After cancellation, [`Subscription::next`] drains values that were
//!   already accepted into the mailbox before reporting terminal, so no
//!   accepted value is silently lost.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Mailbox capacity per subscriber. A subscriber this far behind the
/// publisher is disconnected rather than buffered further.
const MAILBOX_CAPACITY: usize = 10;

/// An index-keyed publish/subscribe registry.
///
/// All registry mutation (`subscribe`, `publish`, `broadcast`) is
/// serialized by a single mutex; receiving on a [`Subscription`] takes
/// no lock.
pub struct SubPub<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

struct Subscriber<T> {
    idx: i64,
    tx: mpsc::Sender<T>,
    token: CancellationToken,
}

/// A handle for receiving published values.
///
/// Returned by [`SubPub::subscribe`]. Call [`next`](Subscription::next)
/// in a loop; `None` means the subscription is done for, either because
/// its token was cancelled or because it fell behind and was closed.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    token: CancellationToken,
}

impl<T> Subscription<T> {
    /// Block until the next value, or `None` when the subscription has
    /// terminated. Values accepted into the mailbox before cancellation
    /// are still returned, one per call, before the terminal `None`.
    pub async fn next(&mut self) -> Option<T> {
        tokio::select! {
            msg = self.rx.recv() => msg,
            _ = self.token.cancelled() => {
                // Cancelled, but drain anything already accepted first.
                self.rx.try_recv().ok()
            }
        }
    }
}

impl<T> Default for SubPub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubPub<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register an interest in values published with an index greater
    /// than `idx`, subject to cancellation of `parent`. The returned
    /// subscription can be cancelled independently of other subscribers
    /// sharing the same parent token.
    pub fn subscribe(&self, parent: &CancellationToken, idx: i64) -> Subscription<T> {
        let token = parent.child_token();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let mut subs = self.subscribers.lock().unwrap();
        subs.push(Subscriber {
            idx,
            tx,
            token: token.clone(),
        });

        Subscription { rx, token }
    }

    /// Number of currently registered subscribers (cancelled ones linger
    /// until the next publish or broadcast reaps them).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl<T: Clone> SubPub<T> {
    /// Deliver `value` to all subscribers waiting for values after an
    /// index less than `idx`. Subscribers that are behind (full mailbox)
    /// are disconnected; cancelled subscribers are reaped.
    pub fn publish(&self, idx: i64, value: T) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain_mut(|sub| {
            if sub.token.is_cancelled() {
                // Dropping the sender closes the mailbox.
                return false;
            }
            if sub.idx >= idx {
                // Not interested yet: already has this index or beyond.
                return true;
            }
            match sub.tx.try_send(value.clone()) {
                Ok(()) => {
                    sub.idx = idx;
                    true
                }
                Err(_) => {
                    // Mailbox full: the subscriber is behind.
                    sub.token.cancel();
                    false
                }
            }
        });
    }

    /// Deliver `value` to every subscriber regardless of index, without
    /// advancing any subscriber's index.
    pub fn broadcast(&self, value: T) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain_mut(|sub| {
            if sub.token.is_cancelled() {
                return false;
            }
            match sub.tx.try_send(value.clone()) {
                Ok(()) => true,
                Err(_) => {
                    sub.token.cancel();
                    false
                }
            }
        });
    }
}
