//! Long-poll registry: maps a pay key (hash of order id and merchant key)
//! to the requests currently suspended on it. Payment and refund events
//! wake matching waiters; handlers re-check the database after registering
//! and before sleeping, so a wake racing the registration is never lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use taler_common::amount::Amount;
use taler_common::crypto::hash::Sha512Hash;
use taler_common::crypto::keys::EddsaPublicKey;

use crate::metrics;

/// The wake-up channel identifier for one order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayKey(Sha512Hash);

impl PayKey {
    pub fn compute(order_id: &str, merchant_pub: &EddsaPublicKey) -> Self {
        PayKey(Sha512Hash::compute_concat([
            order_id.as_bytes(),
            merchant_pub.as_bytes().as_slice(),
        ]))
    }
}

/// What woke a suspended request
#[derive(Debug, Clone)]
pub enum WakeEvent {
    /// The contract reached the paid state
    Paid,
    /// A browser session was bound to an order
    SessionBound,
    /// Cumulative refund for the contract grew to this total
    RefundIncreased(Amount),
    /// The registry is shutting down; handlers abort cleanly
    Shutdown,
}

struct Waiter {
    id: u64,
    /// Refund waiters only match refund totals at or above this threshold
    min_refund: Option<Amount>,
    tx: oneshot::Sender<WakeEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    waiters: HashMap<PayKey, Vec<Waiter>>,
    shutdown: bool,
}

/// Process-wide registry of suspended requests
#[derive(Clone, Default)]
pub struct LongPollRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl LongPollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the calling request. The returned handle delivers at most one
    /// event; dropping it (timeout, cancellation) deregisters the waiter.
    pub fn suspend(&self, key: PayKey, min_refund: Option<Amount>) -> WaitHandle {
        let (tx, rx) = oneshot::channel();
        let id;
        {
            let mut inner = self.inner.lock().expect("longpoll registry poisoned");
            id = inner.next_id;
            inner.next_id += 1;
            if inner.shutdown {
                let _ = tx.send(WakeEvent::Shutdown);
            } else {
                inner.waiters.entry(key).or_default().push(Waiter {
                    id,
                    min_refund,
                    tx,
                });
            }
        }
        metrics::LONGPOLL_SUSPENDED.inc();
        WaitHandle {
            registry: self.clone(),
            key,
            id,
            rx,
        }
    }

    /// Deliver `event` to every matching waiter, in registration order.
    pub fn wake(&self, key: PayKey, event: WakeEvent) {
        let mut woken = 0usize;
        {
            let mut inner = self.inner.lock().expect("longpoll registry poisoned");
            let Some(waiters) = inner.waiters.remove(&key) else {
                return;
            };
            let mut kept = Vec::with_capacity(waiters.len());
            for waiter in waiters {
                if waiter_matches(&waiter, &event) {
                    let _ = waiter.tx.send(event.clone());
                    woken += 1;
                } else {
                    kept.push(waiter);
                }
            }
            if !kept.is_empty() {
                inner.waiters.insert(key, kept);
            }
        }
        if woken > 0 {
            debug!(?event, woken, "long-poll wake");
        }
    }

    /// Resume every waiter with a shutdown marker; later suspends resolve
    /// immediately.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("longpoll registry poisoned");
        inner.shutdown = true;
        for (_, waiters) in inner.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.tx.send(WakeEvent::Shutdown);
            }
        }
    }

    fn deregister(&self, key: PayKey, id: u64) {
        let mut inner = self.inner.lock().expect("longpoll registry poisoned");
        if let Some(waiters) = inner.waiters.get_mut(&key) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                inner.waiters.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn waiter_count(&self, key: PayKey) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.waiters.get(&key).map(|w| w.len()).unwrap_or(0)
    }
}

fn waiter_matches(waiter: &Waiter, event: &WakeEvent) -> bool {
    match event {
        WakeEvent::Paid | WakeEvent::SessionBound => waiter.min_refund.is_none(),
        WakeEvent::RefundIncreased(total) => match &waiter.min_refund {
            Some(threshold) => matches!(
                total.cmp_checked(threshold),
                Ok(std::cmp::Ordering::Greater) | Ok(std::cmp::Ordering::Equal)
            ),
            None => false,
        },
        WakeEvent::Shutdown => true,
    }
}

/// A parked request. Await `wait` with a timeout; drop deregisters.
pub struct WaitHandle {
    registry: LongPollRegistry,
    key: PayKey,
    id: u64,
    rx: oneshot::Receiver<WakeEvent>,
}

impl WaitHandle {
    /// Wait until an event arrives or `timeout` elapses. `None` on timeout.
    pub async fn wait(&mut self, timeout: Duration) -> Option<WakeEvent> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(event)) => Some(event),
            // Sender dropped (registry cleared us) or timer fired
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.registry.deregister(self.key, self.id);
        metrics::LONGPOLL_SUSPENDED.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taler_common::crypto::keys::EddsaPrivateKey;

    fn key(tag: &str) -> PayKey {
        PayKey::compute(tag, &EddsaPrivateKey::from_seed([1; 32]).public())
    }

    fn amount(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_paid_event_wakes_plain_waiter() {
        let registry = LongPollRegistry::new();
        let mut handle = registry.suspend(key("ord-A"), None);
        registry.wake(key("ord-A"), WakeEvent::Paid);
        assert!(matches!(
            handle.wait(Duration::from_secs(1)).await,
            Some(WakeEvent::Paid)
        ));
    }

    #[tokio::test]
    async fn test_wake_is_scoped_to_the_pay_key() {
        let registry = LongPollRegistry::new();
        let mut handle = registry.suspend(key("ord-A"), None);
        registry.wake(key("ord-B"), WakeEvent::Paid);
        assert!(handle.wait(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_refund_threshold_predicate() {
        let registry = LongPollRegistry::new();
        let mut below = registry.suspend(key("ord-A"), Some(amount("KUDOS:0.5")));
        let mut above = registry.suspend(key("ord-A"), Some(amount("KUDOS:2")));

        registry.wake(key("ord-A"), WakeEvent::RefundIncreased(amount("KUDOS:1")));

        assert!(matches!(
            below.wait(Duration::from_secs(1)).await,
            Some(WakeEvent::RefundIncreased(_))
        ));
        assert!(above.wait(Duration::from_millis(50)).await.is_none());
        // The unmatched waiter stays registered for the next event
        registry.wake(key("ord-A"), WakeEvent::RefundIncreased(amount("KUDOS:2")));
        assert!(matches!(
            above.wait(Duration::from_secs(1)).await,
            Some(WakeEvent::RefundIncreased(_))
        ));
    }

    #[tokio::test]
    async fn test_refund_event_does_not_wake_paid_waiter() {
        let registry = LongPollRegistry::new();
        let mut plain = registry.suspend(key("ord-A"), None);
        registry.wake(key("ord-A"), WakeEvent::RefundIncreased(amount("KUDOS:1")));
        assert!(plain.wait(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_deregisters() {
        let registry = LongPollRegistry::new();
        {
            let mut handle = registry.suspend(key("ord-A"), None);
            assert!(handle.wait(Duration::from_millis(10)).await.is_none());
        }
        assert_eq!(registry.waiter_count(key("ord-A")), 0);
    }

    #[tokio::test]
    async fn test_shutdown_resumes_everyone() {
        let registry = LongPollRegistry::new();
        let mut a = registry.suspend(key("ord-A"), None);
        let mut b = registry.suspend(key("ord-B"), Some(amount("KUDOS:1")));
        registry.shutdown();
        assert!(matches!(
            a.wait(Duration::from_secs(1)).await,
            Some(WakeEvent::Shutdown)
        ));
        assert!(matches!(
            b.wait(Duration::from_secs(1)).await,
            Some(WakeEvent::Shutdown)
        ));
        // A suspend after shutdown resolves immediately
        let mut late = registry.suspend(key("ord-C"), None);
        assert!(matches!(
            late.wait(Duration::from_secs(1)).await,
            Some(WakeEvent::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_wake_preserves_registration_order() {
        let registry = LongPollRegistry::new();
        let mut first = registry.suspend(key("ord-A"), None);
        let mut second = registry.suspend(key("ord-A"), None);
        registry.wake(key("ord-A"), WakeEvent::Paid);
        // Both woken by a single event; order of delivery follows registration
        assert!(first.wait(Duration::from_secs(1)).await.is_some());
        assert!(second.wait(Duration::from_secs(1)).await.is_some());
    }

    #[test]
    fn test_pay_key_is_stable_and_distinct() {
        let merchant = EddsaPrivateKey::from_seed([2; 32]).public();
        assert_eq!(
            PayKey::compute("ord-A", &merchant),
            PayKey::compute("ord-A", &merchant)
        );
        assert_ne!(
            PayKey::compute("ord-A", &merchant),
            PayKey::compute("ord-B", &merchant)
        );
    }
}
