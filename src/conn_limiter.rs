use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, Notify};

use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// The stream-listener contract [`ConnLimiter`] wraps. Implemented for both
/// [`crate::virtual_listener::VirtualListener`] and `tokio::net::TcpListener` so the limiter can
/// sit in front of either a real kernel listener or a dispatcher-fed virtual one.
///
/// Native `async fn` in traits keeps this non-dyn-safe, which is fine: `ConnLimiter` is always
/// generic over one concrete listener type, never stored as a trait object.
pub trait StreamListener: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept(&self) -> impl Future<Output = Result<(Self::Conn, SocketAddr)>> + Send;
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
    fn local_addr(&self) -> SocketAddr;
}

impl StreamListener for tokio::net::TcpListener {
    type Conn = tokio::net::TcpStream;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr)> {
        let (conn, addr) = tokio::net::TcpListener::accept(self).await?;
        Ok((conn, addr))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        tokio::net::TcpListener::local_addr(self).unwrap_or_else(|_| "0.0.0.0:0".parse().expect("valid addr"))
    }
}

impl StreamListener for crate::virtual_listener::VirtualListener {
    type Conn = tokio::net::TcpStream;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr)> {
        crate::virtual_listener::VirtualListener::accept(self).await
    }

    async fn close(&self) -> Result<()> {
        crate::virtual_listener::VirtualListener::close(self).await
    }

    fn local_addr(&self) -> SocketAddr {
        crate::virtual_listener::VirtualListener::local_addr(self).as_socket_addr()
    }
}

/// The hysteresis admission counter shared by every [`LimitedListener`] built from the same
/// [`ConnLimiter`].
///
/// Realizes the spec's "condition variable" with `tokio::sync::Mutex` guarding `current`/
/// `is_accepting` plus `tokio::sync::Notify` for waking waiters — the async-idiomatic equivalent
/// of a `Condvar`, since `accept` suspends at an `.await` point rather than blocking an OS thread.
struct Counter {
    current: u32,
    is_accepting: bool,
}

impl Counter {
    /// Pure state transition for a successful `accept`: increments `current` and flips
    /// `is_accepting` off once `stop` is reached. Returns `false` (no mutation) if not currently
    /// accepting, so the caller knows to wait instead.
    ///
    /// Factored out of `ConnLimiter::admit` so the hysteresis invariant (§8 property 3) can be
    /// proptested without a runtime.
    fn try_increment(&mut self, stop: u32) -> bool {
        if !self.is_accepting {
            return false;
        }

        self.current += 1;
        if self.current == stop {
            self.is_accepting = false;
        }
        true
    }

    /// Pure state transition for a connection release: decrements `current` and flips
    /// `is_accepting` back on once `current` drains to `resume`.
    fn decrement(&mut self, resume: u32) {
        self.current = self.current.saturating_sub(1);
        if self.current <= resume {
            self.is_accepting = true;
        }
    }
}

pub struct ConnLimiter {
    id: String,
    stop: u32,
    resume: u32,
    state: Mutex<Counter>,
    notify: Notify,
    metrics: Metrics,
}

impl ConnLimiter {
    /// `stop` must be greater than zero and `resume` must not exceed it.
    pub fn new(id: impl Into<String>, stop: u32, resume: u32, metrics: Metrics) -> Arc<Self> {
        assert!(stop > 0, "ConnLimiter::new: stop must be > 0");
        assert!(resume <= stop, "ConnLimiter::new: resume must be <= stop");

        Arc::new(Self {
            id: id.into(),
            stop,
            resume,
            state: Mutex::new(Counter {
                current: 0,
                is_accepting: true,
            }),
            notify: Notify::new(),
            metrics,
        })
    }

    /// Wraps `listener` so every accepted connection is gated by this limiter's shared counter.
    ///
    /// Multiple listeners can share one `ConnLimiter`: its counter, mutex and condition variable
    /// are shared across every `wrap` call, but each returned `LimitedListener` owns its own
    /// closed flag, so closing one wrapped listener never poisons admission for the others.
    pub fn wrap<L: StreamListener>(self: &Arc<Self>, listener: L) -> LimitedListener<L> {
        LimitedListener {
            limiter: self.clone(),
            listener: Arc::new(listener),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Waits until either the shared counter admits one more connection, or `listener_closed`
    /// (the calling `LimitedListener`'s own flag) is set.
    async fn admit(&self, listener_closed: &AtomicBool) -> Result<()> {
        loop {
            if listener_closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            // Register for a wakeup *before* checking the flag, so a notify that lands between
            // the check and the wait is never missed.
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().await;
                if state.try_increment(self.stop) {
                    self.metrics.limiter_active_connections_inc(&self.id);
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    async fn release_async(&self) {
        let mut state = self.state.lock().await;
        state.decrement(self.resume);
        drop(state);

        self.metrics.limiter_active_connections_dec(&self.id);
        self.notify.notify_waiters();
    }
}

/// A [`StreamListener`] wrapped by a [`ConnLimiter`].
pub struct LimitedListener<L> {
    limiter: Arc<ConnLimiter>,
    listener: Arc<L>,
    closed: Arc<AtomicBool>,
}

impl<L: StreamListener> LimitedListener<L> {
    pub async fn accept(&self) -> Result<(LimitedConn<L::Conn>, SocketAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let start = Instant::now();
        self.limiter.admit(&self.closed).await?;
        self.limiter
            .metrics
            .record_limiter_wait_duration(&self.limiter.id, start.elapsed());

        match self.listener.accept().await {
            Ok((conn, addr)) => Ok((
                LimitedConn {
                    inner: Some(conn),
                    limiter: self.limiter.clone(),
                    closed: false,
                },
                addr,
            )),
            Err(err) => {
                self.limiter.release_async().await;
                Err(err)
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        self.listener.close().await?;
        // The counter/condition variable are shared with every other listener wrapping the same
        // `ConnLimiter`; broadcasting here only wakes this listener's own blocked `accept` calls
        // (they alone check `self.closed`), not theirs.
        self.limiter.notify.notify_waiters();
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }
}

/// A connection accepted through a [`LimitedListener`]. The first `close` (explicit or via
/// `Drop`) releases this connection's slot in the shared counter; further closes return
/// [`Error::Closed`].
pub struct LimitedConn<C> {
    inner: Option<C>,
    limiter: Arc<ConnLimiter>,
    closed: bool,
}

impl<C> LimitedConn<C> {
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.closed = true;
        self.inner.take();
        self.limiter.release_async().await;
        Ok(())
    }
}

impl<C> Drop for LimitedConn<C> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            limiter.release_async().await;
        });
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for LimitedConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "closed"))),
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for LimitedConn<C> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_write(cx, buf),
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "closed"))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Increment,
        Decrement,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Increment), Just(Op::Decrement)]
    }

    proptest! {
        /// Invariant 3: for any finite sequence of increment/decrement starting from
        /// `current = 0`, `0 <= current <= stop` always holds, and `is_accepting` always matches
        /// the hysteresis rule (off at `stop`, back on at `resume`).
        #[test]
        fn hysteresis_invariant_holds(
            stop in 1u32..10,
            resume in 0u32..10,
            ops in proptest::collection::vec(op(), 0..100),
        ) {
            // `resume < stop` strictly: at `resume == stop` there is no hysteresis gap, and
            // `current == stop` (reached via increment) legitimately coexists with
            // `current <= resume`, which would make the invariants below ambiguous.
            let resume = resume.min(stop - 1);
            let mut counter = Counter { current: 0, is_accepting: true };

            for op in ops {
                match op {
                    Op::Increment => { counter.try_increment(stop); }
                    Op::Decrement => counter.decrement(resume),
                }

                prop_assert!(counter.current <= stop);
                if counter.current <= resume {
                    prop_assert!(counter.is_accepting);
                }
                if counter.current == stop {
                    prop_assert!(!counter.is_accepting);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FakeConn;

    impl AsyncRead for FakeConn {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FakeConn {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct FakeListener;

    impl StreamListener for FakeListener {
        type Conn = FakeConn;

        async fn accept(&self) -> Result<(Self::Conn, SocketAddr)> {
            Ok((FakeConn, "127.0.0.1:1".parse().expect("valid addr")))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:1".parse().expect("valid addr")
        }
    }

    #[tokio::test]
    async fn hysteresis_blocks_at_stop_and_resumes_at_resume() {
        let limiter = ConnLimiter::new("test", 2, 1, Metrics::new());
        let listener = limiter.wrap(FakeListener);

        let (conn_a, _) = listener.accept().await.unwrap();
        let (mut conn_b, _) = listener.accept().await.unwrap();

        let accept_fut = listener.accept();
        tokio::pin!(accept_fut);
        tokio::select! {
            _ = &mut accept_fut => panic!("accept should block while at stop threshold"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        conn_b.close().await.unwrap();
        let (_conn_c, _) = accept_fut.await.unwrap();

        drop(conn_a);

        let accept_fut = listener.accept();
        tokio::pin!(accept_fut);
        tokio::select! {
            _ = &mut accept_fut => panic!("accept should block again at stop threshold"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }

    #[tokio::test]
    async fn double_close_on_listener_returns_closed() {
        let limiter = ConnLimiter::new("test", 1, 0, Metrics::new());
        let listener = limiter.wrap(FakeListener);

        listener.close().await.unwrap();
        assert!(matches!(listener.close().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn double_close_on_conn_returns_closed() {
        let limiter = ConnLimiter::new("test", 1, 0, Metrics::new());
        let listener = limiter.wrap(FakeListener);

        let (mut conn, _) = listener.accept().await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(conn.close().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn closing_one_listener_does_not_poison_others_sharing_the_limiter() {
        let limiter = ConnLimiter::new("test", 2, 1, Metrics::new());
        let listener_a = limiter.wrap(FakeListener);
        let listener_b = limiter.wrap(FakeListener);

        listener_a.close().await.unwrap();

        assert!(matches!(listener_a.accept().await, Err(Error::Closed)));
        // `listener_b` shares the same counter/condition variable but was never closed, so it
        // must still admit connections normally.
        assert!(listener_b.accept().await.is_ok());
    }
}
