//! Exchange registry: one shared session per canonical base URL, each with
//! its own keys-fetch task. Lookups await the session's `Ready` state; a
//! fetch failure arms an exponential-backoff retry. Sessions live until
//! shutdown and are never evicted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taler_common::crypto::keys::EddsaPublicKey;
use taler_exchange_client::types::WireFee;
use taler_exchange_client::{canonical_base_url, ExchangeClient, ExchangeKeys};

use crate::config::ExchangeConfig;
use crate::metrics;

/// First retry delay after a failed keys fetch
pub const BACKOFF_FLOOR: Duration = Duration::from_millis(1);
/// Retry delays never exceed this
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Doubling backoff with downward jitter of at most 25%
pub struct RetryBackoff {
    current: Duration,
}

impl RetryBackoff {
    pub fn new() -> Self {
        RetryBackoff {
            current: BACKOFF_FLOOR,
        }
    }

    /// The delay to sleep before the next attempt; doubles the base each call
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(BACKOFF_CAP);
        apply_jitter(base)
    }

    /// Current un-jittered base (what the next call will jitter from)
    pub fn base(&self) -> Duration {
        self.current
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_jitter(d: Duration) -> Duration {
    let quarter_us = (d.as_micros() / 4) as u64;
    if quarter_us == 0 {
        return d;
    }
    let jitter = rand::thread_rng().gen_range(0..=quarter_us);
    d - Duration::from_micros(jitter)
}

/// A ready exchange: connected client plus its parsed key set
#[derive(Clone)]
pub struct ExchangeHandle {
    pub client: ExchangeClient,
    pub keys: Arc<ExchangeKeys>,
}

#[derive(Clone)]
enum SessionState {
    /// No usable keys yet; a fetch (or retry) task is running
    Pending,
    Ready(ExchangeHandle),
    Shutdown,
}

/// One live exchange session
struct ExchangeSession {
    base_url: String,
    trusted: bool,
    state: watch::Sender<SessionState>,
}

/// What a successful find delivers
pub struct FoundExchange {
    pub handle: ExchangeHandle,
    pub trusted: bool,
    /// Fee for the wire method the caller asked about, if the exchange
    /// published one
    pub wire_fee: Option<WireFee>,
}

/// Errors from `find`
#[derive(Debug, thiserror::Error)]
pub enum FindError {
    #[error("not a valid exchange base URL")]
    BadUrl,
    #[error("exchange registry is shutting down")]
    Shutdown,
}

struct ManagerInner {
    sessions: HashMap<String, Arc<ExchangeSession>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: bool,
}

/// Process-wide registry of exchange sessions
pub struct ExchangeManager {
    http: reqwest::Client,
    /// Canonical URL -> configured master key (presence means trusted)
    masters: HashMap<String, EddsaPublicKey>,
    inner: Mutex<ManagerInner>,
}

impl ExchangeManager {
    /// Build the registry and start sessions for all configured exchanges
    pub fn new(http: reqwest::Client, configs: &[ExchangeConfig]) -> Self {
        let mut masters = HashMap::new();
        let mut preload = Vec::new();
        for cfg in configs {
            let Ok(canonical) = canonical_base_url(&cfg.base_url) else {
                warn!(base_url = %cfg.base_url, "skipping unparseable exchange URL");
                continue;
            };
            if let Some(master) = &cfg.master_key {
                if let Ok(key) = EddsaPublicKey::from_base32(master) {
                    masters.insert(canonical.clone(), key);
                }
            }
            preload.push(canonical);
        }
        let manager = ExchangeManager {
            http,
            masters,
            inner: Mutex::new(ManagerInner {
                sessions: HashMap::new(),
                tasks: Vec::new(),
                shutdown: false,
            }),
        };
        for canonical in preload {
            manager.session(&canonical);
        }
        manager
    }

    /// Await the ready handle for `base_url`. The wire method travels with
    /// the lookup; its fee is resolved from the session's key set. Dropping
    /// the returned future cancels the lookup without touching the session.
    pub async fn find(
        &self,
        base_url: &str,
        wire_method: Option<&str>,
    ) -> Result<FoundExchange, FindError> {
        let canonical = canonical_base_url(base_url).map_err(|_| FindError::BadUrl)?;
        let session = self.session(&canonical).ok_or(FindError::Shutdown)?;
        let mut rx = session.state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                SessionState::Ready(handle) => {
                    let wire_fee = wire_method
                        .and_then(|method| handle.keys.wire_fee(method))
                        .cloned();
                    return Ok(FoundExchange {
                        handle,
                        trusted: session.trusted,
                        wire_fee,
                    });
                }
                SessionState::Shutdown => return Err(FindError::Shutdown),
                SessionState::Pending => {
                    rx.changed().await.map_err(|_| FindError::Shutdown)?;
                }
            }
        }
    }

    /// Demote a `Ready` session after a transport failure and restart its
    /// keys fetch. No-op for sessions that are already pending.
    pub fn report_failure(&self, base_url: &str) {
        let Ok(canonical) = canonical_base_url(base_url) else {
            return;
        };
        let mut inner = self.inner.lock().expect("exchange registry poisoned");
        if inner.shutdown {
            return;
        }
        let Some(session) = inner.sessions.get(&canonical).cloned() else {
            return;
        };
        let was_ready = matches!(&*session.state.borrow(), SessionState::Ready(_));
        if !was_ready {
            return;
        }
        warn!(exchange = %canonical, "demoting exchange session after failure");
        session.state.send_replace(SessionState::Pending);
        let task = tokio::spawn(keys_fetch_task(
            session,
            self.http.clone(),
            self.masters.get(&canonical).copied(),
        ));
        inner.tasks.push(task);
    }

    /// Cancel all fetch tasks and fail every pending lookup
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("exchange registry poisoned");
        inner.shutdown = true;
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        for session in inner.sessions.values() {
            session.state.send_replace(SessionState::Shutdown);
        }
    }

    /// Number of live sessions (exactly one per canonical base URL)
    pub fn session_count(&self) -> usize {
        self.inner
            .lock()
            .expect("exchange registry poisoned")
            .sessions
            .len()
    }

    /// Get or create the session for a canonical URL
    fn session(&self, canonical: &str) -> Option<Arc<ExchangeSession>> {
        let mut inner = self.inner.lock().expect("exchange registry poisoned");
        if inner.shutdown {
            return None;
        }
        if let Some(existing) = inner.sessions.get(canonical) {
            return Some(existing.clone());
        }
        let trusted = self.masters.contains_key(canonical);
        let (tx, _) = watch::channel(SessionState::Pending);
        let session = Arc::new(ExchangeSession {
            base_url: canonical.to_string(),
            trusted,
            state: tx,
        });
        info!(exchange = %canonical, trusted, "starting exchange session");
        let task = tokio::spawn(keys_fetch_task(
            session.clone(),
            self.http.clone(),
            self.masters.get(canonical).copied(),
        ));
        inner.tasks.push(task);
        inner.sessions.insert(canonical.to_string(), session.clone());
        Some(session)
    }
}

/// Fetch `/keys` until it succeeds, sleeping with exponential backoff in
/// between. Ends once the session is `Ready`.
async fn keys_fetch_task(
    session: Arc<ExchangeSession>,
    http: reqwest::Client,
    master: Option<EddsaPublicKey>,
) {
    let client = ExchangeClient::connect(http, session.base_url.clone());
    let mut backoff = RetryBackoff::new();
    loop {
        let result = match &master {
            Some(expected) => client.get_keys_verified(expected).await,
            None => client.get_keys().await,
        };
        match result {
            Ok(keys) => {
                info!(
                    exchange = %session.base_url,
                    denoms = keys.denoms.len(),
                    "exchange keys ready"
                );
                session.state.send_replace(SessionState::Ready(ExchangeHandle {
                    client: client.clone(),
                    keys: Arc::new(keys),
                }));
                return;
            }
            Err(e) => {
                metrics::KEYS_FETCH_FAILURES
                    .with_label_values(&[session.base_url.as_str()])
                    .inc();
                let delay = backoff.next_delay();
                warn!(
                    exchange = %session.base_url,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "keys fetch failed; retry armed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = RetryBackoff::new();
        let mut prev_base = backoff.base();
        assert_eq!(prev_base, BACKOFF_FLOOR);
        for _ in 0..24 {
            let delay = backoff.next_delay();
            // Jitter shrinks by at most a quarter and never exceeds the base
            assert!(delay <= prev_base);
            assert!(delay >= prev_base - prev_base / 4);
            assert!(delay <= BACKOFF_CAP);
            let base = backoff.base();
            assert!(base <= prev_base * 2);
            assert!(base <= BACKOFF_CAP);
            prev_base = base;
        }
        assert_eq!(backoff.base(), BACKOFF_CAP);
    }

    #[test]
    fn test_backoff_floor() {
        let mut backoff = RetryBackoff::new();
        assert!(backoff.next_delay() >= Duration::from_micros(750));
    }
}
