use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sent once by every agent slot right after it connects to the relay.
pub const HANDSHAKE_TOKEN: &[u8; 8] = b"CLIENT_S";
/// Body of the `Eof` frame.
pub const END_OF_SESSION_TOKEN: &[u8; 8] = b"MTCP_EOF";
pub const PROTOCOL_V1: u8 = 1;

/// Bytes requested per read on every forwarded stream.
pub const READ_CHUNK_BYTES: usize = 1024;
pub const MAX_FRAME_BYTES: u32 = 64 * 1024;

const KIND_DATA: u8 = 0x00;
const KIND_OPEN: u8 = 0x01;
const KIND_EOF: u8 = 0x02;
const KIND_HANGUP: u8 = 0x03;

const FRAME_HEADER_BYTES: usize = 5;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unknown frame kind {0:#04x}")]
    UnknownFrame(u8),
    #[error("frame too large: {0}")]
    PayloadTooLarge(u32),
    #[error("malformed {0} frame")]
    MalformedControl(&'static str),
    #[error("stream closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer simply went away, as opposed to speaking garbage.
    pub fn is_closed(&self) -> bool {
        match self {
            ProtocolError::Closed => true,
            ProtocolError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Everything exchanged on a connector stream after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque payload, forwarded verbatim.
    Data(Bytes),
    /// Relay to agent: a caller has been paired with this connector.
    Open,
    /// Agent to relay: the target side of the session is gone.
    Eof,
    /// Relay to agent: the caller side of the session is gone.
    Hangup,
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Data(_) => "data",
            Frame::Open => "open",
            Frame::Eof => "eof",
            Frame::Hangup => "hangup",
        }
    }

    pub fn encode(&self) -> Bytes {
        let (kind, body): (u8, &[u8]) = match self {
            Frame::Data(b) => (KIND_DATA, &b[..]),
            Frame::Open => (KIND_OPEN, &[]),
            Frame::Eof => (KIND_EOF, END_OF_SESSION_TOKEN),
            Frame::Hangup => (KIND_HANGUP, &[]),
        };
        let mut out = BytesMut::with_capacity(FRAME_HEADER_BYTES + body.len());
        out.put_u8(kind);
        out.put_u32(body.len() as u32);
        out.put_slice(body);
        out.freeze()
    }
}

pub async fn write_handshake<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), ProtocolError> {
    let mut b = [0u8; 9];
    b[..8].copy_from_slice(HANDSHAKE_TOKEN);
    b[8] = PROTOCOL_V1;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

/// Writes `frame` with a single `write_all` so concurrent writers that share a
/// lock never interleave partial frames.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    w.write_all(&frame.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Writes `data` as consecutive `Data` frames of at most `READ_CHUNK_BYTES`.
pub async fn write_data<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<(), ProtocolError> {
    for chunk in data.chunks(READ_CHUNK_BYTES) {
        w.write_all(&Frame::Data(Bytes::copy_from_slice(chunk)).encode())
            .await?;
    }
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let kind = match r.read_u8().await {
        Ok(k) => k,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Closed);
        }
        Err(err) => return Err(err.into()),
    };
    let n = r.read_u32().await?;

    match kind {
        KIND_DATA => {
            if n > MAX_FRAME_BYTES {
                return Err(ProtocolError::PayloadTooLarge(n));
            }
            let mut buf = vec![0u8; n as usize];
            r.read_exact(&mut buf).await?;
            Ok(Frame::Data(Bytes::from(buf)))
        }
        KIND_OPEN => expect_empty(n, "open").map(|_| Frame::Open),
        KIND_HANGUP => expect_empty(n, "hangup").map(|_| Frame::Hangup),
        KIND_EOF => {
            if n as usize != END_OF_SESSION_TOKEN.len() {
                return Err(ProtocolError::MalformedControl("eof"));
            }
            let mut token = [0u8; 8];
            r.read_exact(&mut token).await?;
            if &token != END_OF_SESSION_TOKEN {
                return Err(ProtocolError::MalformedControl("eof"));
            }
            Ok(Frame::Eof)
        }
        other => Err(ProtocolError::UnknownFrame(other)),
    }
}

fn expect_empty(n: u32, name: &'static str) -> Result<(), ProtocolError> {
    if n != 0 {
        return Err(ProtocolError::MalformedControl(name));
    }
    Ok(())
}

/// Result of looking at the first bytes of an accepted stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Classification {
    /// An agent slot. `leftover` holds bytes read past the handshake; they
    /// belong to the first frame.
    Connector { leftover: Vec<u8> },
    /// Anything else. `prelude` is real payload and must be forwarded.
    Caller { prelude: Vec<u8> },
}

/// Reads until the stream can be told apart: either the bytes diverge from the
/// handshake token, or the full token and version byte have arrived.
pub async fn classify<R: AsyncRead + Unpin>(r: &mut R) -> Result<Classification, ProtocolError> {
    let mut seen: Vec<u8> = Vec::with_capacity(READ_CHUNK_BYTES);
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    let token_len = HANDSHAKE_TOKEN.len();

    loop {
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::Closed);
        }
        seen.extend_from_slice(&chunk[..n]);

        let cmp = seen.len().min(token_len);
        if seen[..cmp] != HANDSHAKE_TOKEN[..cmp] {
            return Ok(Classification::Caller { prelude: seen });
        }
        if seen.len() > token_len {
            let ver = seen[token_len];
            if ver != PROTOCOL_V1 {
                return Err(ProtocolError::BadVersion(ver));
            }
            return Ok(Classification::Connector {
                leftover: seen.split_off(token_len + 1),
            });
        }
    }
}
