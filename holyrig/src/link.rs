//! # Byte-duplex links and per-exchange framing
//!
//! The engine never talks to a serial port directly; it drives any
//! byte-duplex channel behind [`LinkOpener`]. A production deployment opens
//! a serial bridge (ser2net or similar) with [`TcpOpener`]; tests use
//! in-memory duplex pipes.
//!
//! [`RigLink`] performs one request/reply exchange at a time. Reply framing
//! is dynamic: the codec is told the pending [`ReplySpec`] before each
//! write and yields exactly one frame — after a fixed byte count, after a
//! terminator byte, or after the validation-mask length is satisfied.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use holyrig_types::ReplySpec;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::trace;

/// Anything that can carry rig traffic.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> Link for T {}

pub type BoxedLink = Box<dyn Link>;

/// Opens the byte channel to one radio.
///
/// The concrete serial driver is an external collaborator; this trait is
/// the seam it plugs into.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    async fn open(&self) -> io::Result<BoxedLink>;
}

/// Connects to a TCP serial bridge, e.g. ser2net or a rig emulator.
#[derive(Clone, Debug)]
pub struct TcpOpener {
    addr: String,
}

impl TcpOpener {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl LinkOpener for TcpOpener {
    async fn open(&self) -> io::Result<BoxedLink> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("link closed by peer")]
    Closed,
}

/// Frames one reply according to the exchange's pending [`ReplySpec`].
#[derive(Clone, Debug, Default)]
pub struct ExchangeCodec {
    expect: Option<ReplySpec>,
}

impl ExchangeCodec {
    fn expect(&mut self, spec: ReplySpec) {
        self.expect = Some(spec);
    }
}

impl Encoder<Vec<u8>> for ExchangeCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

impl Decoder for ExchangeCodec {
    type Item = Vec<u8>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let wanted = match &self.expect {
            None | Some(ReplySpec::None) => return Ok(None),
            Some(ReplySpec::Length(length)) => Some(*length),
            Some(ReplySpec::Validate(mask)) => Some(mask.len()),
            Some(ReplySpec::Terminator(terminator)) => {
                src.iter().position(|byte| byte == terminator).map(|p| p + 1)
            }
        };

        match wanted {
            Some(length) if src.len() >= length => {
                self.expect = None;
                Ok(Some(src.split_to(length).to_vec()))
            }
            _ => Ok(None),
        }
    }
}

/// One rig's open channel, exchanged with strictly one frame at a time.
#[derive(Debug)]
pub struct RigLink {
    framed: Framed<BoxedLink, ExchangeCodec>,
}

impl RigLink {
    pub fn new(link: BoxedLink) -> Self {
        Self {
            framed: Framed::new(link, ExchangeCodec::default()),
        }
    }

    /// Writes `frame` and reads the reply described by `reply`.
    ///
    /// Returns `None` for write-only exchanges. Stale bytes left over from
    /// an earlier timed-out exchange are discarded before the write.
    pub async fn exchange(
        &mut self,
        frame: &[u8],
        reply: &ReplySpec,
        deadline: Duration,
    ) -> Result<Option<Vec<u8>>, ExchangeError> {
        self.framed.read_buffer_mut().clear();
        self.framed.codec_mut().expect(reply.clone());

        trace!(frame = %holyrig_types::utils::hex_frame(frame), "write");
        self.framed.send(frame.to_vec()).await?;

        if !reply.expects_reply() {
            return Ok(None);
        }

        match timeout(deadline, self.framed.next()).await {
            Err(_) => Err(ExchangeError::Timeout),
            Ok(None) => Err(ExchangeError::Closed),
            Ok(Some(Err(error))) => Err(ExchangeError::Io(error)),
            Ok(Some(Ok(bytes))) => {
                trace!(frame = %holyrig_types::utils::hex_frame(&bytes), "read");
                Ok(Some(bytes))
            }
        }
    }
}
