//! Per-connection idle detection.
//!
//! A [`LivenessMonitor`] tracks the last inbound and outbound activity on a
//! connection and reports [`IdleEvent`]s when a configured threshold passes
//! without traffic. In the server role only [`IdleEvent::ReaderIdle`] is
//! acted on: the peer is presumed dead, unregistered and closed. Clients are
//! expected to send heartbeats well inside the read threshold.
//!
//! ```text
//! ALIVE --(no inbound traffic for read_idle_timeout)--> DISCONNECTING --> CLOSED
//! ```

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tracing::debug;

/// Default read idle timeout in seconds.
pub const DEFAULT_READ_IDLE_TIMEOUT_SECS: u64 = 23;

/// Idle thresholds for a connection. A zero duration disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Silence on the inbound side after which the peer is presumed dead.
    pub read_idle_timeout: Duration,
    /// Silence on the outbound side (informational in the server role).
    pub write_idle_timeout: Duration,
    /// Silence in both directions (informational in the server role).
    pub all_idle_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            read_idle_timeout: Duration::from_secs(DEFAULT_READ_IDLE_TIMEOUT_SECS),
            write_idle_timeout: Duration::ZERO,
            all_idle_timeout: Duration::ZERO,
        }
    }
}

impl LivenessConfig {
    /// Only detect read idleness.
    pub fn read_only(read_idle_timeout: Duration) -> Self {
        Self {
            read_idle_timeout,
            ..Self::default()
        }
    }
}

/// Which threshold elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    ReaderIdle,
    WriterIdle,
    AllIdle,
}

/// Lifecycle of a monitored connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Alive,
    Disconnecting,
    Closed,
}

/// What the connection task should do about an idle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Unregister the connection and close the transport.
    Disconnect,
    /// Nothing to do (informational event, or already disconnecting).
    Ignore,
}

#[derive(Debug, Clone, Copy)]
struct Tracker {
    timeout: Duration,
    last_fired: Option<Instant>,
}

impl Tracker {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_fired: None,
        }
    }

    /// Each event fires once per elapsed period of silence, so the
    /// reference point is whichever is later: the activity or the last fire.
    fn deadline(&self, last_activity: Instant) -> Option<Instant> {
        if self.timeout.is_zero() {
            return None;
        }
        let base = match self.last_fired {
            Some(fired) if fired > last_activity => fired,
            _ => last_activity,
        };
        Some(base + self.timeout)
    }
}

/// Idle detector for one connection.
#[derive(Debug)]
pub struct LivenessMonitor {
    last_read: Instant,
    last_write: Instant,
    reader: Tracker,
    writer: Tracker,
    all: Tracker,
    state: LivenessState,
}

impl LivenessMonitor {
    /// Start monitoring; the connection counts as active right now.
    pub fn new(config: LivenessConfig) -> Self {
        let now = Instant::now();
        Self {
            last_read: now,
            last_write: now,
            reader: Tracker::new(config.read_idle_timeout),
            writer: Tracker::new(config.write_idle_timeout),
            all: Tracker::new(config.all_idle_timeout),
            state: LivenessState::Alive,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Record inbound traffic.
    pub fn record_read(&mut self) {
        self.last_read = Instant::now();
    }

    /// Record inbound traffic observed at `at`; earlier instants are ignored.
    pub fn record_read_at(&mut self, at: Instant) {
        self.last_read = self.last_read.max(at);
    }

    /// Record outbound traffic.
    pub fn record_write(&mut self) {
        self.last_write = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        self.last_read.max(self.last_write)
    }

    /// Earliest instant at which an idle event could fire.
    ///
    /// `None` when every threshold is disabled or the connection is no
    /// longer alive.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.state != LivenessState::Alive {
            return None;
        }
        [
            self.reader.deadline(self.last_read),
            self.writer.deadline(self.last_write),
            self.all.deadline(self.last_activity()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Return the first threshold that has elapsed at `now`, if any.
    ///
    /// Reader idleness is checked first since it is the one that
    /// disconnects. Returns `None` once the connection is disconnecting.
    pub fn poll_idle(&mut self, now: Instant) -> Option<IdleEvent> {
        if self.state != LivenessState::Alive {
            return None;
        }

        let last_activity = self.last_activity();
        let checks = [
            (IdleEvent::ReaderIdle, self.reader.deadline(self.last_read)),
            (IdleEvent::WriterIdle, self.writer.deadline(self.last_write)),
            (IdleEvent::AllIdle, self.all.deadline(last_activity)),
        ];

        let (event, _) = checks
            .into_iter()
            .find(|(_, deadline)| deadline.is_some_and(|d| d <= now))?;

        match event {
            IdleEvent::ReaderIdle => self.reader.last_fired = Some(now),
            IdleEvent::WriterIdle => self.writer.last_fired = Some(now),
            IdleEvent::AllIdle => self.all.last_fired = Some(now),
        }
        Some(event)
    }

    /// Wait until the next idle event fires.
    ///
    /// Never resolves when every threshold is disabled.
    pub async fn idle(&mut self) -> IdleEvent {
        loop {
            if let Some(event) = self.poll_idle(Instant::now()) {
                return event;
            }
            match self.idle_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Decide what an idle event means for this connection.
    ///
    /// Read idleness moves the connection to `Disconnecting` exactly once;
    /// later events are ignored.
    pub fn on_idle(&mut self, event: IdleEvent) -> IdleAction {
        match event {
            IdleEvent::ReaderIdle if self.begin_disconnect() => IdleAction::Disconnect,
            IdleEvent::ReaderIdle => IdleAction::Ignore,
            IdleEvent::WriterIdle | IdleEvent::AllIdle => {
                debug!(?event, "Connection idle");
                IdleAction::Ignore
            }
        }
    }

    /// Move from `Alive` to `Disconnecting`.
    ///
    /// Returns false if the connection was already leaving.
    pub fn begin_disconnect(&mut self) -> bool {
        if self.state == LivenessState::Alive {
            self.state = LivenessState::Disconnecting;
            true
        } else {
            false
        }
    }

    /// The transport is gone.
    pub fn mark_closed(&mut self) {
        self.state = LivenessState::Closed;
    }
}

/// Time of the latest inbound byte, shared between a transport wrapper and
/// the connection task that owns the monitor.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    base: Instant,
    last_nanos: Arc<AtomicU64>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mark inbound activity now.
    pub fn touch(&self) {
        let nanos = u64::try_from(self.base.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Latest recorded activity (the creation time if none).
    pub fn last(&self) -> Instant {
        self.base + Duration::from_nanos(self.last_nanos.load(Ordering::Relaxed))
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport wrapper that touches an [`ActivityClock`] whenever bytes are
/// read, so a peer trickling a partial frame still counts as alive.
#[derive(Debug)]
pub struct ActivityStream<T> {
    inner: T,
    clock: ActivityClock,
}

impl<T> ActivityStream<T> {
    pub fn new(inner: T, clock: ActivityClock) -> Self {
        Self { inner, clock }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ActivityStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.clock.touch();
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ActivityStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
