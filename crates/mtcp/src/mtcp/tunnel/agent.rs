use std::{sync::Arc, time::Duration};

use anyhow::Context;
use rand::{RngExt, rng};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Mutex, oneshot, watch},
    task::{JoinHandle, JoinSet},
};

use crate::mtcp::tunnel::{
    protocol::{self, Frame, READ_CHUNK_BYTES},
    transport::{self, BoxedStream, StreamReader, StreamWriter},
};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub server_addr: String,
    pub target_addr: String,
    pub fleet_size: usize,
    pub dial_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9999".into(),
            target_addr: "127.0.0.1:80".into(),
            fleet_size: 10,
            dial_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(10),
        }
    }
}

/// Keeps `fleet_size` connections registered with the relay and bridges
/// each session they carry to the target service.
pub struct Agent {
    opts: Arc<AgentOptions>,
}

impl Agent {
    pub fn new(mut opts: AgentOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("agent: server_addr is required");
        }
        if opts.target_addr.trim().is_empty() {
            anyhow::bail!("agent: target_addr is required");
        }
        if opts.fleet_size == 0 {
            anyhow::bail!("agent: fleet_size must be at least 1");
        }
        if opts.reconnect_initial.is_zero() {
            opts.reconnect_initial = Duration::from_secs(1);
        }
        if opts.reconnect_max < opts.reconnect_initial {
            opts.reconnect_max = opts.reconnect_initial;
        }
        Ok(Self {
            opts: Arc::new(opts),
        })
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            server = %self.opts.server_addr,
            target = %self.opts.target_addr,
            fleet_size = self.opts.fleet_size,
            "agent: starting"
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.opts.fleet_size {
            let opts = self.opts.clone();
            let shutdown = shutdown.clone();
            slots.spawn(async move { run_slot(opts, slot, shutdown).await });
        }

        while let Some(res) = slots.join_next().await {
            if let Err(err) = res {
                tracing::error!(err = %err, "agent: slot task failed");
            }
        }

        tracing::info!("agent: stopped");
        Ok(())
    }
}

/// Dials, registers and serves one fleet slot until shutdown, redialing with
/// exponential backoff whenever the relay link drops.
async fn run_slot(opts: Arc<AgentOptions>, slot: usize, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = opts.reconnect_initial;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect(&opts).await {
            Ok(stream) => {
                backoff = opts.reconnect_initial;
                tracing::info!(slot, server = %opts.server_addr, "agent: connector registered");
                match SlotSession::new(opts.clone(), slot).run(stream, shutdown.clone()).await {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::warn!(
                            slot,
                            err = %err,
                            backoff = %humantime::format_duration(backoff),
                            "agent: relay link lost; redialing"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    slot,
                    server = %opts.server_addr,
                    err = %format!("{err:#}"),
                    backoff = %humantime::format_duration(backoff),
                    "agent: connect failed; retrying"
                );
            }
        }

        let wait = with_jitter(backoff);
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }

        backoff = (backoff * 2).min(opts.reconnect_max);
    }
}

fn with_jitter(d: Duration) -> Duration {
    let spread = (d.as_millis() as u64 / 5).max(1);
    d + Duration::from_millis(rng().random_range(0..spread))
}

async fn connect(opts: &AgentOptions) -> anyhow::Result<BoxedStream> {
    let mut stream = transport::dial_tcp(&opts.server_addr, opts.dial_timeout).await?;
    protocol::write_handshake(&mut stream)
        .await
        .context("agent: send handshake")?;
    Ok(stream)
}

type RelayWriter = Arc<Mutex<StreamWriter>>;

enum SlotState {
    Idle,
    /// Relay announced a session; the target is dialed on its first payload.
    Pending,
    Active(TargetSession),
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            SlotState::Idle => "idle",
            SlotState::Pending => "pending",
            SlotState::Active(_) => "active",
        }
    }
}

struct SlotSession {
    opts: Arc<AgentOptions>,
    slot: usize,
    state: SlotState,
}

impl SlotSession {
    fn new(opts: Arc<AgentOptions>, slot: usize) -> Self {
        Self {
            opts,
            slot,
            state: SlotState::Idle,
        }
    }

    /// Returns `Ok(())` on shutdown and an error when the relay link drops.
    async fn run(
        mut self,
        stream: BoxedStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let (mut rd, wr) = tokio::io::split(stream);
        let relay: RelayWriter = Arc::new(Mutex::new(wr));

        loop {
            let frame = tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        let mut w = relay.lock().await;
                        let _ = w.shutdown().await;
                        return Ok(());
                    }
                    continue;
                }
                _ = target_done(&mut self.state) => None,
                f = protocol::read_frame(&mut rd) => Some(f),
            };

            let Some(frame) = frame else {
                if let SlotState::Active(t) = std::mem::replace(&mut self.state, SlotState::Idle) {
                    t.close().await;
                }
                continue;
            };
            let frame = match frame {
                Ok(f) => f,
                Err(err) if err.is_closed() => anyhow::bail!("relay closed the connection"),
                Err(err) => return Err(err).context("agent: read from relay"),
            };
            self.on_frame(frame, &relay).await?;
        }
    }

    async fn on_frame(&mut self, frame: Frame, relay: &RelayWriter) -> anyhow::Result<()> {
        let slot = self.slot;
        match (std::mem::replace(&mut self.state, SlotState::Idle), frame) {
            (SlotState::Idle, Frame::Open) => {
                tracing::debug!(slot, "agent: session opened");
                self.state = SlotState::Pending;
            }
            (SlotState::Active(t), Frame::Open) => {
                // The relay only reopens after our end-of-session, which the
                // pump writes as its last act.
                t.close().await;
                tracing::debug!(slot, "agent: session opened");
                self.state = SlotState::Pending;
            }
            (SlotState::Pending, Frame::Open) => {
                tracing::warn!(slot, "agent: open while a session is pending; ignored");
                self.state = SlotState::Pending;
            }

            (SlotState::Pending, Frame::Data(b)) => {
                match TargetSession::open(&self.opts, relay.clone(), slot).await {
                    Ok(mut t) => {
                        tracing::info!(slot, target = %self.opts.target_addr, "agent: target connected");
                        if let Err(err) = t.write(&b).await {
                            tracing::debug!(slot, err = %err, "agent: write to target failed");
                            t.stop();
                        }
                        self.state = SlotState::Active(t);
                    }
                    Err(err) => {
                        tracing::warn!(slot, target = %self.opts.target_addr, err = %format!("{err:#}"), "agent: target dial failed; ending session");
                        send(relay, &Frame::Eof).await?;
                    }
                }
            }
            (SlotState::Active(mut t), Frame::Data(b)) => {
                if t.is_finished() {
                    tracing::debug!(slot, bytes = b.len(), "agent: target already gone; payload dropped");
                } else if let Err(err) = t.write(&b).await {
                    tracing::debug!(slot, err = %err, "agent: write to target failed");
                    t.stop();
                }
                self.state = SlotState::Active(t);
            }
            (SlotState::Idle, Frame::Data(b)) => {
                tracing::debug!(slot, bytes = b.len(), "agent: payload outside a session; dropped");
            }

            (SlotState::Active(t), Frame::Hangup) => {
                tracing::debug!(slot, "agent: relay hung up");
                t.close().await;
            }
            (SlotState::Pending, Frame::Hangup) => {
                tracing::debug!(slot, "agent: relay hung up before any payload");
                send(relay, &Frame::Eof).await?;
            }
            (SlotState::Idle, Frame::Hangup) => {
                tracing::debug!(slot, "agent: hangup for an ended session");
            }

            (state, Frame::Eof) => {
                tracing::warn!(slot, state = state.name(), "agent: unexpected end-of-session from relay; ignored");
                self.state = state;
            }
        }
        Ok(())
    }
}

/// Resolves once the active session's pump has ended; pends otherwise.
async fn target_done(state: &mut SlotState) {
    match state {
        SlotState::Active(t) if !t.pump_done => {
            let _ = (&mut t.pump).await;
            t.pump_done = true;
        }
        _ => std::future::pending().await,
    }
}

async fn send(relay: &RelayWriter, frame: &Frame) -> anyhow::Result<()> {
    let mut w = relay.lock().await;
    protocol::write_frame(&mut *w, frame)
        .await
        .with_context(|| format!("agent: send {}", frame.name()))
}

/// One target connection. Relay payload is written here by the slot loop;
/// target output is pumped back by a spawned task that ends the session with
/// exactly one end-of-session frame.
struct TargetSession {
    writer: StreamWriter,
    stop: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
    pump_done: bool,
}

impl TargetSession {
    async fn open(opts: &AgentOptions, relay: RelayWriter, slot: usize) -> anyhow::Result<Self> {
        let target = transport::dial_tcp(&opts.target_addr, opts.dial_timeout).await?;
        let (rd, writer) = tokio::io::split(target);
        let (stop_tx, stop_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_target(rd, relay, stop_rx, slot));
        Ok(Self {
            writer,
            stop: Some(stop_tx),
            pump,
            pump_done: false,
        })
    }

    fn is_finished(&self) -> bool {
        self.pump_done || self.pump.is_finished()
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }

    /// Closes the target connection, then waits for the pump to report
    /// end-of-session to the relay.
    async fn close(mut self) {
        if let Err(err) = self.writer.shutdown().await {
            tracing::debug!(err = %err, "agent: target shutdown failed");
        }
        self.stop();
        if !self.pump_done {
            let _ = (&mut self.pump).await;
            self.pump_done = true;
        }
    }
}

impl Drop for TargetSession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump_target(
    mut rd: StreamReader,
    relay: RelayWriter,
    mut stop: oneshot::Receiver<()>,
    slot: usize,
) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let reason = loop {
        let n = tokio::select! {
            _ = &mut stop => break "hangup",
            r = rd.read(&mut buf) => match r {
                Ok(0) => break "target closed",
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(slot, err = %err, "agent: target read failed");
                    break "target read failed";
                }
            },
        };

        let mut w = relay.lock().await;
        if let Err(err) = protocol::write_data(&mut *w, &buf[..n]).await {
            tracing::debug!(slot, err = %err, "agent: relay write failed");
            return;
        }
    };

    if let Err(err) = send(&relay, &Frame::Eof).await {
        tracing::debug!(slot, err = %format!("{err:#}"), "agent: could not report end-of-session");
        return;
    }
    tracing::info!(slot, reason, "agent: session ended");
}
