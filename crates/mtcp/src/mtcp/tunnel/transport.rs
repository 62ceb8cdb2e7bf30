use std::time::Duration;

use anyhow::Context;
use tokio::{net::TcpStream, time};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub type StreamReader = tokio::io::ReadHalf<BoxedStream>;
pub type StreamWriter = tokio::io::WriteHalf<BoxedStream>;

/// Dials `addr` over TCP. A zero timeout waits for the OS connect timeout.
pub async fn dial_tcp(addr: &str, timeout: Duration) -> anyhow::Result<BoxedStream> {
    let c = if timeout > Duration::ZERO {
        time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
            .with_context(|| format!("dial {addr}"))?
    } else {
        TcpStream::connect(addr)
            .await
            .with_context(|| format!("dial {addr}"))?
    };
    let _ = c.set_nodelay(true);
    Ok(Box::new(c))
}
