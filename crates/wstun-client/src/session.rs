//! Shared session ownership with transparent, coalesced reconnection.
//!
//! [`SessionManager`] owns the one multiplexed session every local
//! connection opens its stream on. When an open fails because the session
//! is closed, the caller re-establishes it and retries once. Each installed
//! session carries a generation number; a caller only re-establishes if the
//! generation it observed is still current, so concurrent failures against
//! the same dead session produce a single reconnect. A failed reconnect is
//! remembered for a short back-off, and callers queued behind it share the
//! failure instead of dialing again.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wstun_core::{Multiplexer, TransportError, WstunResult};

/// Something that can build a fresh multiplexed session.
pub trait Dialer: Send + Sync + 'static {
    type Session: Multiplexer;

    /// Dial the transport, upgrade it and start a client-role session.
    fn establish(&self) -> impl Future<Output = WstunResult<Self::Session>> + Send;
}

/// How many times one failed open may trigger re-establishment, and how
/// long a failed re-establishment is reported to later callers without
/// dialing again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_reestablish: u32,
    pub failure_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_reestablish: 1,
            failure_backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of the last failed re-establishment.
struct LastFailure {
    generation: u64,
    at: Instant,
    reason: String,
}

/// The installed session and the generation it was installed at.
struct Current<M> {
    generation: u64,
    session: Arc<M>,
}

impl<M> Clone for Current<M> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            session: self.session.clone(),
        }
    }
}

/// Owns the current session and hands out streams on it.
pub struct SessionManager<D: Dialer> {
    dialer: D,
    policy: RetryPolicy,
    current: RwLock<Current<D::Session>>,
    /// Held for the duration of one re-establishment.
    reestablishing: Mutex<Option<LastFailure>>,
}

impl<D: Dialer> SessionManager<D> {
    /// Establish the initial session (generation 0).
    pub async fn connect(dialer: D) -> WstunResult<Self> {
        Self::with_policy(dialer, RetryPolicy::default()).await
    }

    pub async fn with_policy(dialer: D, policy: RetryPolicy) -> WstunResult<Self> {
        let session = dialer.establish().await?;
        info!("session established");
        Ok(Self {
            dialer,
            policy,
            current: RwLock::new(Current {
                generation: 0,
                session: Arc::new(session),
            }),
            reestablishing: Mutex::new(None),
        })
    }

    /// Generation of the currently installed session.
    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    fn snapshot(&self) -> Current<D::Session> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Open a stream on the current session.
    ///
    /// A failure on a session that is still alive is returned as is. A
    /// failure on a closed session re-establishes it (at most
    /// `max_reestablish` times for this call) and retries.
    pub async fn open_stream(&self) -> WstunResult<<D::Session as Multiplexer>::Stream> {
        let mut reestablished = 0;
        loop {
            let current = self.snapshot();
            let err = match current.session.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };

            if !current.session.is_closed() {
                debug!(error = %err, "stream open failed on a live session");
                return Err(err);
            }
            if reestablished >= self.policy.max_reestablish {
                return Err(err);
            }
            reestablished += 1;

            warn!(
                generation = current.generation,
                error = %err,
                "session closed, re-establishing"
            );
            self.reestablish(current.generation).await?;
        }
    }

    /// Replace the session observed at `observed_generation`.
    ///
    /// Returns without dialing if another caller already replaced it, and
    /// fails without dialing if replacing this generation failed within the
    /// policy's back-off.
    pub async fn reestablish(&self, observed_generation: u64) -> WstunResult<()> {
        let mut last_failure = self.reestablishing.lock().await;

        if self.generation() != observed_generation {
            debug!(observed_generation, "session already re-established");
            return Ok(());
        }

        if let Some(failure) = last_failure.as_ref() {
            if failure.generation == observed_generation
                && failure.at.elapsed() < self.policy.failure_backoff
            {
                debug!(observed_generation, "re-establish failed recently, not redialing");
                return Err(TransportError::DialFailed(format!(
                    "re-establish failed recently: {}",
                    failure.reason
                ))
                .into());
            }
        }

        let session = match self.dialer.establish().await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                *last_failure = Some(LastFailure {
                    generation: observed_generation,
                    at: Instant::now(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        *last_failure = None;
        let old = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            let generation = current.generation + 1;
            let old = std::mem::replace(
                &mut *current,
                Current {
                    generation,
                    session,
                },
            );
            info!(generation, "session re-established");
            old
        };
        old.session.close().await;
        Ok(())
    }

    /// Close the current session.
    pub async fn close(&self) {
        self.snapshot().session.close().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use wstun_core::SessionError;

    /// A session that either hands out in-memory streams or, once closed,
    /// fails every open.
    pub(crate) struct FakeSession {
        closed: AtomicBool,
        opens: AtomicUsize,
    }

    impl FakeSession {
        fn new(closed: bool) -> Self {
            Self {
                closed: AtomicBool::new(closed),
                opens: AtomicUsize::new(0),
            }
        }
    }

    impl Multiplexer for FakeSession {
        type Stream = DuplexStream;

        async fn open_stream(&self) -> WstunResult<DuplexStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                return Err(SessionError::Closed.into());
            }
            Ok(tokio::io::duplex(64).0)
        }

        async fn accept_stream(&self) -> WstunResult<DuplexStream> {
            Err(SessionError::Closed.into())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out sessions; the first `dead_first` of them start closed.
    pub(crate) struct FakeDialer {
        establishes: Arc<AtomicUsize>,
        dead_first: usize,
        fail_after_first: bool,
    }

    impl FakeDialer {
        /// Every session it hands out is alive.
        pub(crate) fn live() -> Self {
            Self {
                establishes: Arc::new(AtomicUsize::new(0)),
                dead_first: 0,
                fail_after_first: false,
            }
        }
    }

    impl Dialer for FakeDialer {
        type Session = FakeSession;

        async fn establish(&self) -> WstunResult<FakeSession> {
            let n = self.establishes.fetch_add(1, Ordering::SeqCst);
            if self.fail_after_first && n > 0 {
                return Err(wstun_core::TransportError::DialFailed("refused".into()).into());
            }
            // Give concurrent callers time to pile up behind the lock.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(FakeSession::new(n < self.dead_first))
        }
    }

    fn dialer(dead_first: usize) -> (FakeDialer, Arc<AtomicUsize>) {
        let establishes = Arc::new(AtomicUsize::new(0));
        (
            FakeDialer {
                establishes: establishes.clone(),
                dead_first,
                fail_after_first: false,
            },
            establishes,
        )
    }

    #[tokio::test]
    async fn open_on_live_session() {
        let (d, establishes) = dialer(0);
        let manager = SessionManager::connect(d).await.unwrap();
        manager.open_stream().await.unwrap();
        assert_eq!(establishes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test]
    async fn closed_session_is_replaced_once() {
        let (d, establishes) = dialer(1);
        let manager = SessionManager::connect(d).await.unwrap();
        manager.open_stream().await.unwrap();
        assert_eq!(establishes.load(Ordering::SeqCst), 2);
        assert_eq!(manager.generation(), 1);
    }

    #[tokio::test]
    async fn concurrent_failures_reestablish_exactly_once() {
        let (d, establishes) = dialer(1);
        let manager = Arc::new(SessionManager::connect(d).await.unwrap());
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                manager.open_stream().await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // one initial establish plus a single shared reconnect
        assert_eq!(establishes.load(Ordering::SeqCst), 2);
        assert_eq!(manager.generation(), 1);
    }

    #[tokio::test]
    async fn stale_generation_does_not_redial() {
        let (d, establishes) = dialer(0);
        let manager = SessionManager::connect(d).await.unwrap();
        manager.reestablish(0).await.unwrap();
        assert_eq!(manager.generation(), 1);

        manager.reestablish(0).await.unwrap();
        assert_eq!(manager.generation(), 1);
        assert_eq!(establishes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_is_bounded() {
        // every session comes up dead: one reconnect, then give up
        let (d, establishes) = dialer(usize::MAX);
        let manager = SessionManager::connect(d).await.unwrap();
        let err = manager.open_stream().await.err().unwrap();
        assert!(err.is_session_closed());
        assert_eq!(establishes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reestablish_failure_reaches_the_caller() {
        let establishes = Arc::new(AtomicUsize::new(0));
        let d = FakeDialer {
            establishes: establishes.clone(),
            dead_first: 1,
            fail_after_first: true,
        };
        let manager = SessionManager::connect(d).await.unwrap();
        let err = manager.open_stream().await.err().unwrap();
        assert!(matches!(err, wstun_core::WstunError::Transport(_)));
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test]
    async fn concurrent_failed_reestablish_is_shared() {
        let establishes = Arc::new(AtomicUsize::new(0));
        let d = FakeDialer {
            establishes: establishes.clone(),
            dead_first: 1,
            fail_after_first: true,
        };
        let manager = Arc::new(SessionManager::connect(d).await.unwrap());
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                manager.open_stream().await.map(|_| ())
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().err().unwrap();
            assert!(matches!(err, wstun_core::WstunError::Transport(_)));
        }

        // one initial establish plus a single failed reconnect
        assert_eq!(establishes.load(Ordering::SeqCst), 2);
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test]
    async fn failed_reestablish_is_retried_after_backoff() {
        let establishes = Arc::new(AtomicUsize::new(0));
        let d = FakeDialer {
            establishes: establishes.clone(),
            dead_first: 1,
            fail_after_first: true,
        };
        let policy = RetryPolicy {
            max_reestablish: 1,
            failure_backoff: Duration::from_millis(50),
        };
        let manager = SessionManager::with_policy(d, policy).await.unwrap();

        assert!(manager.reestablish(0).await.is_err());
        assert!(manager.reestablish(0).await.is_err());
        assert_eq!(establishes.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(manager.reestablish(0).await.is_err());
        assert_eq!(establishes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn replaced_session_is_closed() {
        let (d, _) = dialer(0);
        let manager = SessionManager::connect(d).await.unwrap();
        let first = manager.snapshot().session;
        manager.reestablish(0).await.unwrap();
        assert!(first.is_closed());
        assert_eq!(first.opens.load(Ordering::SeqCst), 0);
    }
}
