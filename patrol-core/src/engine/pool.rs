use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PoolSection;
use crate::driver::{PageSession, SessionDriver};

use super::error::{EngineError, EngineResult};
use super::events::{EngineEvent, EventSink};

/// One pooled automation session. Owned by the pool; lent to exactly one
/// caller at a time via `PooledSession`.
pub struct Session {
    id: Uuid,
    page: Box<dyn PageSession>,
    last_used: Instant,
}

impl Session {
    fn new(page: Box<dyn PageSession>) -> Self {
        Self {
            id: Uuid::new_v4(),
            page,
            last_used: Instant::now(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("last_used", &self.last_used)
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Session>,
    live: usize,
    leased: HashSet<Uuid>,
    closed: bool,
}

enum AcquirePlan {
    Reuse(Session),
    Create,
    Wait,
}

/// Bounded pool of reusable sessions. Sessions are created lazily up to
/// `max_sessions`; idle ones past the idle timeout are swept on each
/// acquire/release rather than by a dedicated timer task. Pool-wide
/// bookkeeping sits under a single lock because the max-size invariant
/// needs global visibility.
pub struct SessionPool {
    driver: Arc<dyn SessionDriver>,
    max_sessions: usize,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
    notify: Notify,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("max_sessions", &self.max_sessions)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl SessionPool {
    pub fn new(
        driver: Arc<dyn SessionDriver>,
        section: &PoolSection,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            driver,
            max_sessions: section.max_sessions.max(1),
            acquire_timeout: section.acquire_timeout(),
            idle_timeout: section.idle_timeout(),
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
            sink,
        }
    }

    /// Hands out an exclusive session, creating one lazily while below the
    /// size cap. Blocks until a session frees up, the acquire timeout
    /// elapses (`PoolExhausted`), the pool closes, or the caller cancels.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> EngineResult<PooledSession> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            let plan = {
                let mut st = self.state.lock().unwrap();
                if st.closed {
                    return Err(EngineError::PoolClosed);
                }
                self.sweep_idle(&mut st);
                if let Some(mut session) = st.idle.pop_front() {
                    session.last_used = Instant::now();
                    st.leased.insert(session.id);
                    AcquirePlan::Reuse(session)
                } else if st.live < self.max_sessions {
                    st.live += 1;
                    AcquirePlan::Create
                } else {
                    AcquirePlan::Wait
                }
            };

            match plan {
                AcquirePlan::Reuse(session) => {
                    return Ok(PooledSession {
                        pool: Arc::clone(self),
                        session: Some(session),
                    });
                }
                AcquirePlan::Create => match self.driver.open().await {
                    Ok(page) => {
                        let session = Session::new(page);
                        self.sink
                            .record(&EngineEvent::SessionOpened { session: session.id });
                        let mut st = self.state.lock().unwrap();
                        st.leased.insert(session.id);
                        drop(st);
                        return Ok(PooledSession {
                            pool: Arc::clone(self),
                            session: Some(session),
                        });
                    }
                    Err(err) => {
                        // Failed creations never count against capacity.
                        let mut st = self.state.lock().unwrap();
                        st.live -= 1;
                        drop(st);
                        self.notify.notify_one();
                        return Err(EngineError::SessionCreate(err));
                    }
                },
                AcquirePlan::Wait => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::cancelled()),
                        _ = self.notify.notified() => {}
                        _ = sleep_until(deadline) => {
                            return Err(EngineError::PoolExhausted {
                                waited: self.acquire_timeout,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Marks the pool closed, destroys all idle sessions and waits up to
    /// `grace` for leased sessions to come back. Late releases are
    /// destroyed because the pool is closed.
    pub async fn close(&self, grace: Duration) {
        let drained: Vec<Session> = {
            let mut st = self.state.lock().unwrap();
            st.closed = true;
            st.live -= st.idle.len();
            st.idle.drain(..).collect()
        };
        for session in drained {
            self.discard(session, "pool closed");
        }
        self.notify.notify_waiters();

        let deadline = Instant::now() + grace;
        loop {
            if self.state.lock().unwrap().live == 0 {
                return;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep_until(deadline) => {
                    let leftover = self.state.lock().unwrap().live;
                    warn!(leftover, "pool close grace elapsed with sessions still leased");
                    return;
                }
            }
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn idle_sessions(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }

    fn give_back(&self, mut session: Session, healthy: bool) {
        let discard = {
            let mut st = self.state.lock().unwrap();
            if !st.leased.remove(&session.id) {
                panic!(
                    "session {} released twice or not leased from this pool",
                    session.id
                );
            }
            if healthy && !st.closed {
                session.last_used = Instant::now();
                st.idle.push_back(session);
                None
            } else {
                st.live -= 1;
                let reason = if healthy { "pool closed" } else { "unhealthy" };
                Some((session, reason))
            }
        };
        if let Some((session, reason)) = discard {
            self.discard(session, reason);
        }
        self.notify.notify_one();
    }

    fn sweep_idle(&self, st: &mut PoolState) {
        let now = Instant::now();
        while st
            .idle
            .front()
            .map(|session| session.last_used + self.idle_timeout <= now)
            .unwrap_or(false)
        {
            if let Some(session) = st.idle.pop_front() {
                st.live -= 1;
                self.discard(session, "idle timeout");
            }
        }
    }

    fn discard(&self, session: Session, reason: &str) {
        self.sink.record(&EngineEvent::SessionDiscarded {
            session: session.id,
            reason: reason.to_string(),
        });
        let page = session.page;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = page.close().await {
                        debug!(error = %err, "session close failed");
                    }
                });
            }
            Err(_) => debug!("no runtime available for session close"),
        }
    }
}

/// Exclusive lease on a pooled session. `release` consumes the guard so a
/// session cannot be returned twice from safe code; dropping without an
/// explicit release discards the session as unhealthy.
pub struct PooledSession {
    pool: Arc<SessionPool>,
    session: Option<Session>,
}

impl PooledSession {
    pub fn id(&self) -> Uuid {
        self.session
            .as_ref()
            .expect("session present until release")
            .id
    }

    pub fn page(&self) -> &dyn PageSession {
        self.session
            .as_ref()
            .expect("session present until release")
            .page
            .as_ref()
    }

    pub fn release(mut self, healthy: bool) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session, healthy);
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .finish()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(session = %session.id, "session guard dropped without explicit release");
            self.pool.give_back(session, false);
        }
    }
}
