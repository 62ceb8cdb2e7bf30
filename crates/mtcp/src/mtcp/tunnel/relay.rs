use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::TcpListener,
    sync::{Semaphore, watch},
    time::{self, Instant},
};

use crate::mtcp::{
    net, telemetry,
    tunnel::{
        connector::{Connector, Role, SessionEnd, SharedConnector},
        pool::ConnectionPool,
        protocol::{self, Classification, Frame, READ_CHUNK_BYTES},
        registry::SessionRegistry,
        transport::{BoxedStream, StreamReader},
    },
};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub listen_addr: String,
    pub pool_size: usize,
    /// Callers allowed to wait for a connector at once; 0 means unlimited.
    pub max_pending_callers: usize,
    /// Zero waits forever.
    pub acquire_timeout: Duration,
    /// Zero disables the caller idle timeout.
    pub idle_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            listen_addr: ":9999".into(),
            pool_size: 10,
            max_pending_callers: 0,
            acquire_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    /// Queued connectors. Entries whose stream closed while queued are still
    /// counted until `acquire` skips them.
    pub available: usize,
    pub live_connectors: usize,
    pub lost_connectors: u64,
    pub sessions: usize,
}

/// Everything a relay's session loops share. Built once per relay.
pub struct RelayContext {
    pub pool: ConnectionPool,
    pub sessions: SessionRegistry,
    pending: Option<Arc<Semaphore>>,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    id_seq: AtomicU64,
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl RelayContext {
    pub fn new(opts: &RelayOptions) -> Self {
        let pending = if opts.max_pending_callers > 0 {
            Some(Arc::new(Semaphore::new(opts.max_pending_callers)))
        } else {
            None
        };
        Self {
            pool: ConnectionPool::new(opts.pool_size),
            sessions: SessionRegistry::new(),
            pending,
            acquire_timeout: opts.acquire_timeout,
            idle_timeout: opts.idle_timeout,
            id_seq: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("c-{n}")
    }

    pub async fn status(&self) -> PoolStatus {
        let fleet = self.sessions.fleet().await;
        PoolStatus {
            capacity: self.pool.capacity(),
            available: self.pool.available(),
            live_connectors: fleet.live_connectors,
            lost_connectors: fleet.lost_connectors,
            sessions: self.sessions.len().await,
        }
    }
}

pub struct Relay {
    opts: RelayOptions,
    ctx: Arc<RelayContext>,
}

impl Relay {
    pub fn new(opts: RelayOptions) -> anyhow::Result<Self> {
        if opts.listen_addr.trim().is_empty() {
            anyhow::bail!("relay: listen_addr is required");
        }
        if opts.pool_size == 0 {
            anyhow::bail!("relay: pool_size must be at least 1");
        }
        let ctx = Arc::new(RelayContext::new(&opts));
        Ok(Self { opts, ctx })
    }

    pub fn context(&self) -> Arc<RelayContext> {
        self.ctx.clone()
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("relay: bind {}", self.opts.listen_addr))?;

        tracing::info!(
            listen_addr = %self.opts.listen_addr,
            pool_size = self.opts.pool_size,
            max_pending_callers = self.opts.max_pending_callers,
            "relay: listening"
        );

        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "relay: accept failed");
                            time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let _ = conn.set_nodelay(true);
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        serve_conn(ctx, Box::new(conn), peer.to_string()).await;
                    });
                }
            }
        }

        tracing::info!(listen_addr = %self.opts.listen_addr, "relay: stopped accepting");
        Ok(())
    }
}

/// Runs one accepted stream to completion: classify, then drive it as either a
/// local connector or an external caller.
pub async fn serve_conn(ctx: Arc<RelayContext>, stream: BoxedStream, remote: String) {
    let (mut rd, wr) = tokio::io::split(stream);
    let conn = Arc::new(Connector::new(ctx.next_id(), remote, wr));

    let class = if ctx.idle_timeout > Duration::ZERO {
        match time::timeout(ctx.idle_timeout, protocol::classify(&mut rd)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::debug!(conn = %conn.id(), remote = %conn.remote(), "relay: no traffic before idle timeout");
                conn.close().await;
                return;
            }
        }
    } else {
        protocol::classify(&mut rd).await
    };

    match class {
        Ok(Classification::Connector { leftover }) => {
            conn.set_role(Role::LocalConnector);
            let rd = std::io::Cursor::new(leftover).chain(rd);
            run_connector(ctx, conn, rd).await;
        }
        Ok(Classification::Caller { prelude }) => {
            conn.set_role(Role::ExternalCaller);
            run_caller(ctx, conn, rd, prelude).await;
        }
        Err(err) => {
            if err.is_closed() {
                tracing::debug!(conn = %conn.id(), remote = %conn.remote(), "relay: closed before first read");
            } else {
                tracing::warn!(conn = %conn.id(), remote = %conn.remote(), err = %err, "relay: classification failed");
            }
            conn.close().await;
        }
    }
}

async fn run_connector<R: AsyncRead + Unpin>(
    ctx: Arc<RelayContext>,
    conn: SharedConnector,
    mut rd: R,
) {
    let _active = telemetry::ActiveConnGuard::new(Role::LocalConnector.as_str());
    let live = ctx.sessions.connector_joined().await;
    tracing::info!(
        connector = %conn.id(),
        remote = %conn.remote(),
        live,
        "relay: local connector registered"
    );

    if let Err(err) = ctx.pool.add(conn.clone()).await {
        tracing::warn!(connector = %conn.id(), err = %err, "relay: pool add failed");
    }

    let err = loop {
        let frame = match protocol::read_frame(&mut rd).await {
            Ok(f) => f,
            Err(err) => break err,
        };
        match frame {
            Frame::Data(b) => match conn.peer().await {
                Some(caller) => match caller.write_raw(&b).await {
                    Ok(()) => telemetry::record_bytes("egress", b.len()),
                    Err(err) => {
                        tracing::debug!(connector = %conn.id(), caller = %caller.id(), err = %err, "relay: write to caller failed");
                    }
                },
                None => {
                    tracing::debug!(connector = %conn.id(), bytes = b.len(), "relay: dropped payload of an ended session");
                }
            },
            Frame::Eof => end_session_from_local(&ctx, &conn).await,
            other => {
                tracing::warn!(connector = %conn.id(), frame = other.name(), "relay: unexpected frame from agent; ignored");
            }
        }
    };

    if err.is_closed() {
        tracing::debug!(connector = %conn.id(), "relay: local connector stream closed");
    } else {
        tracing::warn!(connector = %conn.id(), err = %err, "relay: local connector failed");
    }
    lose_connector(&ctx, &conn).await;
}

/// The agent reported its target closed: drop the caller and put the
/// connector back in the pool.
async fn end_session_from_local(ctx: &RelayContext, conn: &SharedConnector) {
    let caller = match conn.end_session().await {
        SessionEnd::Ended { caller } => caller,
        SessionEnd::NotInSession => {
            tracing::warn!(connector = %conn.id(), "relay: end-of-session with no session open; ignored");
            return;
        }
    };
    match caller {
        Some(caller) => {
            caller.close().await;
            caller.clear_peer_if(conn.id()).await;
            ctx.sessions.remove(caller.id()).await;
            tracing::info!(connector = %conn.id(), caller = %caller.id(), "relay: session ended by local side");
        }
        None => {
            tracing::debug!(connector = %conn.id(), "relay: end-of-session acknowledged");
        }
    }

    if conn.is_closed() {
        return;
    }
    if let Err(err) = ctx.pool.release(conn.clone()).await {
        tracing::warn!(connector = %conn.id(), err = %err, "relay: pool release failed");
    }
}

async fn lose_connector(ctx: &RelayContext, conn: &SharedConnector) {
    conn.close().await;

    if let Some(caller) = conn.take_peer().await {
        caller.close().await;
        caller.clear_peer_if(conn.id()).await;
        ctx.sessions.remove(caller.id()).await;
        tracing::info!(connector = %conn.id(), caller = %caller.id(), "relay: dropped caller of lost connector");
    }

    metrics::counter!("mtcp_connectors_lost_total").increment(1);
    let remaining = ctx.sessions.connector_lost().await;
    tracing::info!(connector = %conn.id(), remaining, "relay: local connector removed");

    if remaining == 0 {
        let dropped = ctx.pool.drain(ctx.pool.capacity());
        tracing::warn!(dropped, "relay: every local connector is gone; drained pool");
    }
}

async fn run_caller(
    ctx: Arc<RelayContext>,
    conn: SharedConnector,
    mut rd: StreamReader,
    prelude: Vec<u8>,
) {
    let _active = telemetry::ActiveConnGuard::new(Role::ExternalCaller.as_str());
    ctx.sessions.register_caller(&conn).await;
    tracing::info!(caller = %conn.id(), remote = %conn.remote(), "relay: external caller connected");

    let reason = match forward_caller_chunk(&ctx, &conn, &prelude).await {
        Err(reason) => reason,
        Ok(()) => {
            drop(prelude);
            caller_read_loop(&ctx, &conn, &mut rd).await
        }
    };

    teardown_caller(&ctx, &conn, reason).await;
}

async fn caller_read_loop(
    ctx: &RelayContext,
    conn: &SharedConnector,
    rd: &mut StreamReader,
) -> &'static str {
    let mut closed = conn.closed();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = tokio::select! {
            _ = wait_closed(&mut closed) => return "closed by local side",
            r = read_with_idle(rd, &mut buf, ctx.idle_timeout) => r,
        };
        let n = match read {
            Ok(Some(0)) => return "caller closed",
            Ok(Some(n)) => n,
            Ok(None) => return "idle timeout",
            Err(err) => {
                tracing::debug!(caller = %conn.id(), err = %err, "relay: caller read failed");
                return "caller read failed";
            }
        };
        if let Err(reason) = forward_caller_chunk(ctx, conn, &buf[..n]).await {
            return reason;
        }
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

async fn read_with_idle<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut [u8],
    idle: Duration,
) -> std::io::Result<Option<usize>> {
    if idle.is_zero() {
        return rd.read(buf).await.map(Some);
    }
    match time::timeout(idle, rd.read(buf)).await {
        Ok(res) => res.map(Some),
        Err(_) => Ok(None),
    }
}

async fn forward_caller_chunk(
    ctx: &RelayContext,
    caller: &SharedConnector,
    data: &[u8],
) -> Result<(), &'static str> {
    if caller.is_closed() {
        return Err("closed by local side");
    }
    let connector = match caller.peer().await {
        Some(c) => c,
        None => pair(ctx, caller).await?,
    };
    match connector.forward_from(caller.id(), data).await {
        Ok(true) => {
            telemetry::record_bytes("ingress", data.len());
            Ok(())
        }
        Ok(false) => Err("closed by local side"),
        Err(err) => {
            tracing::debug!(caller = %caller.id(), connector = %connector.id(), err = %err, "relay: write to connector failed");
            Err("connector write failed")
        }
    }
}

/// Blocks until a live connector is available, then links it with `caller`.
async fn pair(ctx: &RelayContext, caller: &SharedConnector) -> Result<SharedConnector, &'static str> {
    let _permit = match &ctx.pending {
        Some(sem) => match sem.clone().try_acquire_owned() {
            Ok(p) => Some(p),
            Err(_) => {
                tracing::warn!(caller = %caller.id(), "relay: too many callers waiting for a connector");
                return Err("backlog full");
            }
        },
        None => None,
    };

    if ctx.pool.available() == 0 {
        tracing::debug!(caller = %caller.id(), "relay: no idle connector; waiting");
    }

    let deadline = (ctx.acquire_timeout > Duration::ZERO).then(|| Instant::now() + ctx.acquire_timeout);
    loop {
        let acquired = match deadline {
            Some(at) => match time::timeout_at(at, ctx.pool.acquire()).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!(caller = %caller.id(), "relay: timed out waiting for a connector");
                    return Err("acquire timeout");
                }
            },
            None => ctx.pool.acquire().await,
        };
        let connector = match acquired {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(caller = %caller.id(), err = %err, "relay: acquire failed");
                return Err("pool closed");
            }
        };

        caller.set_peer(connector.clone()).await;
        if let Err(err) = connector.open_session(caller).await {
            tracing::debug!(caller = %caller.id(), connector = %connector.id(), err = %err, "relay: connector died before pairing; retrying");
            caller.clear_peer_if(connector.id()).await;
            continue;
        }

        ctx.sessions.bind(caller.id(), connector.id()).await;
        metrics::counter!("mtcp_sessions_total").increment(1);
        tracing::info!(caller = %caller.id(), connector = %connector.id(), "relay: paired");
        return Ok(connector);
    }
}

async fn teardown_caller(ctx: &RelayContext, caller: &SharedConnector, reason: &str) {
    caller.close().await;
    ctx.sessions.remove(caller.id()).await;

    if let Some(connector) = caller.take_peer().await {
        match connector.hangup_if(caller.id()).await {
            Ok(true) => {
                tracing::debug!(caller = %caller.id(), connector = %connector.id(), "relay: sent hangup to agent");
            }
            Ok(false) => {}
            Err(err) => {
                tracing::debug!(caller = %caller.id(), connector = %connector.id(), err = %err, "relay: hangup failed");
            }
        }
    }

    tracing::info!(caller = %caller.id(), reason, "relay: external caller closed");
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{future::Future, net::SocketAddr};

    use bytes::Bytes;
    use tokio::{io::AsyncWriteExt, net::TcpStream};

    use super::*;
    use crate::mtcp::tunnel::protocol::{read_frame, write_frame, write_handshake};

    pub(crate) async fn start_relay(
        opts: RelayOptions,
    ) -> (Arc<RelayContext>, SocketAddr, watch::Sender<bool>) {
        let relay = Relay::new(opts).unwrap();
        let ctx = relay.context();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { relay.serve(ln, rx).await });
        (ctx, addr, tx)
    }

    fn test_opts() -> RelayOptions {
        RelayOptions {
            listen_addr: "127.0.0.1:0".into(),
            pool_size: 4,
            ..RelayOptions::default()
        }
    }

    pub(crate) async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if check().await {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    async fn fake_connector(addr: SocketAddr) -> TcpStream {
        let mut s = TcpStream::connect(addr).await.unwrap();
        write_handshake(&mut s).await.unwrap();
        s
    }

    async fn read_payload(s: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut got = Vec::new();
        while got.len() < len {
            match time::timeout(Duration::from_secs(3), read_frame(s)).await.unwrap().unwrap() {
                Frame::Data(b) => got.extend_from_slice(&b),
                other => panic!("expected data, got {other:?}"),
            }
        }
        got
    }

    async fn expect_frame(s: &mut TcpStream) -> Frame {
        time::timeout(Duration::from_secs(3), read_frame(s))
            .await
            .unwrap()
            .unwrap()
    }

    async fn assert_closed(s: &mut TcpStream) {
        let mut b = [0u8; 64];
        let res = time::timeout(Duration::from_secs(3), s.read(&mut b))
            .await
            .expect("stream should be closed by the relay");
        assert!(matches!(res, Ok(0) | Err(_)), "unexpected read: {res:?}");
    }

    #[tokio::test]
    async fn connector_handshake_lands_in_pool() {
        let (ctx, addr, _stop) = start_relay(test_opts()).await;
        let _c1 = fake_connector(addr).await;
        let _c2 = fake_connector(addr).await;

        eventually("two pooled connectors", || async { ctx.pool.available() == 2 }).await;
        let st = ctx.status().await;
        assert_eq!(st.live_connectors, 2);
        assert_eq!(st.capacity, 4);
        assert_eq!(st.sessions, 0);
    }

    #[tokio::test]
    async fn caller_payload_is_forwarded_both_ways() {
        let (ctx, addr, _stop) = start_relay(test_opts()).await;
        let mut c = fake_connector(addr).await;
        eventually("pooled connector", || async { ctx.pool.available() == 1 }).await;

        let mut e = TcpStream::connect(addr).await.unwrap();
        e.write_all(b"GET /").await.unwrap();

        assert_eq!(expect_frame(&mut c).await, Frame::Open);
        assert_eq!(read_payload(&mut c, 5).await, b"GET /");

        write_frame(&mut c, &Frame::Data(Bytes::from_static(b"HTTP/1.1 200 OK")))
            .await
            .unwrap();
        let mut got = [0u8; 15];
        e.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"HTTP/1.1 200 OK");

        let snap = ctx.sessions.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert!(snap[0].connector_id.is_some());
        assert_eq!(ctx.pool.available(), 0);
    }

    #[tokio::test]
    async fn eof_closes_caller_and_connector_is_reused() {
        let (ctx, addr, _stop) = start_relay(test_opts()).await;
        let mut c = fake_connector(addr).await;
        eventually("pooled connector", || async { ctx.pool.available() == 1 }).await;

        let mut e1 = TcpStream::connect(addr).await.unwrap();
        e1.write_all(b"first").await.unwrap();
        assert_eq!(expect_frame(&mut c).await, Frame::Open);
        assert_eq!(read_payload(&mut c, 5).await, b"first");

        write_frame(&mut c, &Frame::Eof).await.unwrap();
        assert_closed(&mut e1).await;
        eventually("connector back in pool", || async { ctx.pool.available() == 1 }).await;
        eventually("session removed", || async { ctx.sessions.len().await == 0 }).await;

        let mut e3 = TcpStream::connect(addr).await.unwrap();
        e3.write_all(b"third").await.unwrap();
        assert_eq!(expect_frame(&mut c).await, Frame::Open);
        assert_eq!(read_payload(&mut c, 5).await, b"third");
    }

    #[tokio::test]
    async fn duplicate_eof_does_not_requeue_connector() {
        let (ctx, addr, _stop) = start_relay(test_opts()).await;
        let mut c = fake_connector(addr).await;
        eventually("pooled connector", || async { ctx.pool.available() == 1 }).await;

        let mut e = TcpStream::connect(addr).await.unwrap();
        e.write_all(b"once").await.unwrap();
        assert_eq!(expect_frame(&mut c).await, Frame::Open);
        assert_eq!(read_payload(&mut c, 4).await, b"once");

        write_frame(&mut c, &Frame::Eof).await.unwrap();
        write_frame(&mut c, &Frame::Eof).await.unwrap();
        assert_closed(&mut e).await;
        eventually("connector back in pool", || async { ctx.pool.available() == 1 }).await;
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.pool.available(), 1);

        // An end-of-session while idle in the pool is ignored too.
        write_frame(&mut c, &Frame::Eof).await.unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.pool.available(), 1);
    }

    async fn paired_count(ctx: &RelayContext) -> usize {
        ctx.sessions
            .snapshot()
            .await
            .iter()
            .filter(|s| s.connector_id.is_some())
            .count()
    }

    /// Pooled + paired + lost connectors.
    async fn accounted_connectors(ctx: &RelayContext) -> usize {
        ctx.pool.available() + paired_count(ctx).await + ctx.status().await.lost_connectors as usize
    }

    #[tokio::test]
    async fn every_connector_is_pooled_paired_or_lost() {
        const FLEET: usize = 4;
        let (ctx, addr, _stop) = start_relay(test_opts()).await;

        // Register one at a time so the pool hands them out in this order.
        let mut conns = Vec::new();
        for i in 1..=FLEET {
            conns.push(fake_connector(addr).await);
            eventually("connector pooled", || async { ctx.pool.available() == i }).await;
        }
        assert_eq!(accounted_connectors(&ctx).await, FLEET);

        let mut callers = Vec::new();
        for k in 1..=2 {
            let mut e = TcpStream::connect(addr).await.unwrap();
            e.write_all(b"req").await.unwrap();
            eventually("caller paired", || async { paired_count(&ctx).await == k }).await;
            assert_eq!(ctx.pool.available(), FLEET - k);
            assert_eq!(accounted_connectors(&ctx).await, FLEET);
            callers.push(e);
        }

        // Lose the connector serving the first caller.
        drop(conns.remove(0));
        assert_closed(&mut callers[0]).await;
        eventually("connector counted as lost", || async {
            ctx.status().await.lost_connectors == 1 && paired_count(&ctx).await == 1
        })
        .await;
        assert_eq!(accounted_connectors(&ctx).await, FLEET);

        // End the second caller's session from the agent side.
        let c2 = &mut conns[0];
        assert_eq!(expect_frame(c2).await, Frame::Open);
        assert_eq!(read_payload(c2, 3).await, b"req");
        write_frame(c2, &Frame::Eof).await.unwrap();
        assert_closed(&mut callers[1]).await;
        eventually("connector released", || async {
            ctx.pool.available() == FLEET - 1 && paired_count(&ctx).await == 0
        })
        .await;
        assert_eq!(accounted_connectors(&ctx).await, FLEET);
    }

    #[tokio::test]
    async fn caller_close_sends_hangup_and_waits_for_ack() {
        let (ctx, addr, _stop) = start_relay(test_opts()).await;
        let mut c = fake_connector(addr).await;
        eventually("pooled connector", || async { ctx.pool.available() == 1 }).await;

        let mut e = TcpStream::connect(addr).await.unwrap();
        e.write_all(b"bye").await.unwrap();
        assert_eq!(expect_frame(&mut c).await, Frame::Open);
        assert_eq!(read_payload(&mut c, 3).await, b"bye");
        drop(e);

        assert_eq!(expect_frame(&mut c).await, Frame::Hangup);
        eventually("session removed", || async { ctx.sessions.len().await == 0 }).await;
        assert_eq!(ctx.pool.available(), 0);

        write_frame(&mut c, &Frame::Eof).await.unwrap();
        eventually("connector back in pool", || async { ctx.pool.available() == 1 }).await;
    }

    #[tokio::test]
    async fn concurrent_callers_get_distinct_connectors() {
        let (ctx, addr, _stop) = start_relay(test_opts()).await;
        let mut c1 = fake_connector(addr).await;
        let mut c2 = fake_connector(addr).await;
        eventually("two pooled connectors", || async { ctx.pool.available() == 2 }).await;

        let mut e1 = TcpStream::connect(addr).await.unwrap();
        let mut e2 = TcpStream::connect(addr).await.unwrap();
        e1.write_all(b"one").await.unwrap();
        e2.write_all(b"two").await.unwrap();

        assert_eq!(expect_frame(&mut c1).await, Frame::Open);
        assert_eq!(expect_frame(&mut c2).await, Frame::Open);
        let p1 = read_payload(&mut c1, 3).await;
        let p2 = read_payload(&mut c2, 3).await;
        let mut both = vec![p1.clone(), p2.clone()];
        both.sort();
        assert_eq!(both, vec![b"one".to_vec(), b"two".to_vec()]);

        // Each connector answers its own caller only.
        write_frame(&mut c1, &Frame::Data(Bytes::from(p1.to_ascii_uppercase())))
            .await
            .unwrap();
        write_frame(&mut c2, &Frame::Data(Bytes::from(p2.to_ascii_uppercase())))
            .await
            .unwrap();
        let mut r1 = [0u8; 3];
        let mut r2 = [0u8; 3];
        e1.read_exact(&mut r1).await.unwrap();
        e2.read_exact(&mut r2).await.unwrap();
        assert_eq!(&r1, b"ONE");
        assert_eq!(&r2, b"TWO");

        let snap = ctx.sessions.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert_ne!(snap[0].connector_id, snap[1].connector_id);
    }

    #[tokio::test]
    async fn fleet_loss_drops_callers_and_drains_pool() {
        let opts = RelayOptions {
            acquire_timeout: Duration::from_millis(200),
            ..test_opts()
        };
        let (ctx, addr, _stop) = start_relay(opts).await;
        let c1 = fake_connector(addr).await;
        let c2 = fake_connector(addr).await;
        eventually("two pooled connectors", || async { ctx.pool.available() == 2 }).await;

        let mut e = TcpStream::connect(addr).await.unwrap();
        e.write_all(b"hi").await.unwrap();
        eventually("caller paired", || async { ctx.pool.available() == 1 }).await;
        drop(c1);
        drop(c2);

        assert_closed(&mut e).await;
        eventually("fleet gone", || async {
            ctx.sessions.fleet().await.live_connectors == 0
        })
        .await;
        eventually("pool drained", || async { ctx.pool.available() == 0 }).await;
        assert_eq!(ctx.status().await.lost_connectors, 2);

        let mut late = TcpStream::connect(addr).await.unwrap();
        late.write_all(b"anyone?").await.unwrap();
        assert_closed(&mut late).await;
    }

    #[tokio::test]
    async fn backlog_limit_turns_away_extra_callers() {
        let opts = RelayOptions {
            max_pending_callers: 1,
            ..test_opts()
        };
        let (ctx, addr, _stop) = start_relay(opts).await;

        let mut e1 = TcpStream::connect(addr).await.unwrap();
        e1.write_all(b"wait").await.unwrap();
        eventually("first caller registered", || async { ctx.sessions.len().await == 1 }).await;
        time::sleep(Duration::from_millis(100)).await;

        let mut e2 = TcpStream::connect(addr).await.unwrap();
        e2.write_all(b"nope").await.unwrap();
        assert_closed(&mut e2).await;

        let mut c = fake_connector(addr).await;
        assert_eq!(expect_frame(&mut c).await, Frame::Open);
        assert_eq!(read_payload(&mut c, 4).await, b"wait");
    }

    #[tokio::test]
    async fn idle_caller_is_dropped() {
        let opts = RelayOptions {
            idle_timeout: Duration::from_millis(150),
            ..test_opts()
        };
        let (ctx, addr, _stop) = start_relay(opts).await;
        let mut c = fake_connector(addr).await;
        eventually("pooled connector", || async { ctx.pool.available() == 1 }).await;

        let mut e = TcpStream::connect(addr).await.unwrap();
        e.write_all(b"x").await.unwrap();
        assert_eq!(expect_frame(&mut c).await, Frame::Open);
        assert_eq!(read_payload(&mut c, 1).await, b"x");

        assert_eq!(expect_frame(&mut c).await, Frame::Hangup);
        assert_closed(&mut e).await;
    }

    #[tokio::test]
    async fn serve_conn_works_over_in_memory_streams() {
        let ctx = Arc::new(RelayContext::new(&RelayOptions {
            pool_size: 1,
            ..RelayOptions::default()
        }));

        let (agent_near, mut agent) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_conn(ctx.clone(), Box::new(agent_near), "agent".into()));
        write_handshake(&mut agent).await.unwrap();
        eventually("pooled connector", || async { ctx.pool.available() == 1 }).await;

        let (caller_near, mut caller) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_conn(ctx.clone(), Box::new(caller_near), "caller".into()));
        caller.write_all(b"ping").await.unwrap();

        assert_eq!(read_frame(&mut agent).await.unwrap(), Frame::Open);
        assert_eq!(
            read_frame(&mut agent).await.unwrap(),
            Frame::Data(Bytes::from_static(b"ping"))
        );
        write_frame(&mut agent, &Frame::Data(Bytes::from_static(b"pong")))
            .await
            .unwrap();
        write_frame(&mut agent, &Frame::Eof).await.unwrap();

        let mut got = Vec::new();
        caller.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"pong");
        eventually("connector back in pool", || async { ctx.pool.available() == 1 }).await;
    }
}
