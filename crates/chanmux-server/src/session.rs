//! One session per live connection: a single dispatch loop feeding the
//! router, an outbound write path, and an error-report sink.
//!
//! State only moves forward: `Idle -> Open -> Closed`. The loop ends on a
//! connection read failure or on `stop()`; either path closes the
//! connection at most once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use chanmux_core::ids::SessionId;
use chanmux_core::{MessageRouter, RouteError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionError, MessageKind};

const DEFAULT_ERROR_CAPACITY: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Open,
    Closed,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bound of the error-report sink.
    pub error_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Reading from the connection failed. Ends the session.
    #[error("transport error: {0}")]
    Transport(ConnectionError),

    /// One inbound message could not be routed. The session keeps going.
    #[error("route error: {0}")]
    Route(#[from] RouteError),

    #[error("write error: {0}")]
    Write(ConnectionError),

    #[error("session already opened")]
    AlreadyOpen,

    #[error("session not open")]
    NotOpen,

    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Route(_) => "route",
            Self::Write(_) => "write",
            Self::AlreadyOpen => "already_open",
            Self::NotOpen => "not_open",
            Self::Closed => "closed",
        }
    }
}

struct Inner {
    id: SessionId,
    router: Arc<dyn MessageRouter>,
    errors: mpsc::Sender<SessionError>,
    conn: OnceLock<Arc<dyn Connection>>,
    state: watch::Sender<SessionState>,
    /// Fired when the session closes; unblocks reads and enqueues.
    cancel: CancellationToken,
    conn_closed: AtomicBool,
    dropped_reports: AtomicU64,
}

impl Inner {
    /// Open -> Closed. Returns whether this call made the transition.
    fn mark_closed(&self) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
        if transitioned {
            self.cancel.cancel();
            tracing::info!(session_id = %self.id, "Session closed");
        }
        transitioned
    }

    async fn close_connection(&self) {
        if self.conn_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conn) = self.conn.get() {
            if let Err(e) = conn.close().await {
                tracing::debug!(session_id = %self.id, error = %e, "Connection close failed");
            }
        }
    }

    /// Non-blocking report: a full sink drops the report.
    fn report(&self, err: SessionError) {
        match self.errors.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                self.dropped_reports.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session_id = %self.id,
                    error = %err,
                    "Error sink full, dropping report"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Waits for room in the sink unless the session is stopped meanwhile.
    async fn report_fatal(&self, err: SessionError) {
        tokio::select! {
            biased;
            sent = self.errors.send(err) => {
                if sent.is_err() {
                    tracing::debug!(
                        session_id = %self.id,
                        "Error sink dropped before fatal report"
                    );
                }
            }
            _ = self.cancel.cancelled() => {
                self.dropped_reports.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Handle to a session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create an idle session. The receiver is the error-report sink and
    /// must be drained by the caller.
    pub fn new(
        router: Arc<dyn MessageRouter>,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionError>) {
        let (errors, errors_rx) = mpsc::channel(config.error_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Idle);
        let inner = Inner {
            id: SessionId::new(),
            router,
            errors,
            conn: OnceLock::new(),
            state,
            cancel: CancellationToken::new(),
            conn_closed: AtomicBool::new(false),
            dropped_reports: AtomicU64::new(0),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            errors_rx,
        )
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn router(&self) -> &Arc<dyn MessageRouter> {
        &self.inner.router
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Reports lost because the sink was full (or the session was stopped
    /// while a fatal report waited for room).
    pub fn dropped_reports(&self) -> u64 {
        self.inner.dropped_reports.load(Ordering::Relaxed)
    }

    /// Attach the connection and start the dispatch loop. Must be called
    /// from within a tokio runtime.
    pub fn open(&self, conn: Arc<dyn Connection>) -> Result<(), SessionError> {
        if self.inner.conn.set(Arc::clone(&conn)).is_err() {
            return Err(match self.state() {
                SessionState::Closed => SessionError::Closed,
                _ => SessionError::AlreadyOpen,
            });
        }
        self.inner.state.send_replace(SessionState::Open);
        tracing::info!(
            session_id = %self.inner.id,
            channels = ?self.inner.router.channels(),
            "Session opened"
        );
        tokio::spawn(dispatch_loop(Arc::clone(&self.inner), conn));
        Ok(())
    }

    /// Send `payload` as a text message. Errors come straight from the
    /// connection and are not reported to the error sink.
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Idle => return Err(SessionError::NotOpen),
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Open => {}
        }
        let conn = self.inner.conn.get().ok_or(SessionError::NotOpen)?;
        conn.write_message(MessageKind::Text, payload.into())
            .await
            .map_err(SessionError::Write)
    }

    /// Close the session. No-op when idle or already closed; safe to race
    /// with the dispatch loop's own close.
    pub async fn stop(&self) {
        if self.inner.mark_closed() {
            self.inner.close_connection().await;
        }
    }

    /// Wait until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }
}

async fn dispatch_loop(inner: Arc<Inner>, conn: Arc<dyn Connection>) {
    let cancel = inner.cancel.clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = conn.next_message() => next,
        };

        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                tracing::info!(session_id = %inner.id, error = %e, "Connection read failed");
                inner.close_connection().await;
                inner.report_fatal(SessionError::Transport(e)).await;
                inner.mark_closed();
                break;
            }
        };

        // Routing may wait on a full queue; closing the session cuts it short.
        let routed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            routed = inner.router.route(&msg.data) => routed,
        };
        if let Err(e) = routed {
            tracing::debug!(
                session_id = %inner.id,
                error = %e,
                kind = e.error_kind(),
                "Dropping unroutable message"
            );
            inner.report(SessionError::Route(e));
        }
    }
    tracing::debug!(session_id = %inner.id, "Dispatch loop exited");
}
