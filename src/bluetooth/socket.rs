//! Transport socket abstraction for PBAP connections.
//!
//! A [`PbapSocket`] wraps one physical connection to the remote phonebook
//! server, either L2CAP or RFCOMM, behind a single byte-stream interface.
//! Test code substitutes the underlying streams through
//! [`PbapSocket::from_streams`] instead of touching BlueZ.

use std::{
   collections::VecDeque,
   sync::atomic::{AtomicUsize, Ordering},
   time::Duration,
};

use bluer::{Adapter, Address, AddressType, l2cap, rfcomm};
use log::{debug, warn};
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   time,
};

use crate::error::{PbapError, Result};

/// Fixed OBEX packet size for this profile, the minimum the specification
/// requires every implementation to accept.
pub const PBAP_PACKET_SIZE: u16 = 255;

/// Valid range for L2CAP PSM and RFCOMM channel values.
const CHANNEL_RANGE: std::ops::RangeInclusive<u16> = 1..=30;

type Reader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Which transport a socket was opened over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
   L2cap,
   Rfcomm,
}

/// One physical connection to the remote device.
///
/// Closing invalidates both byte streams atomically; any further read or
/// write fails with [`PbapError::SocketClosed`].
pub struct PbapSocket {
   remote: Address,
   kind: ConnectionKind,
   reader: Option<Reader>,
   writer: Option<Writer>,
}

impl std::fmt::Debug for PbapSocket {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PbapSocket")
         .field("remote", &self.remote)
         .field("kind", &self.kind)
         .finish_non_exhaustive()
   }
}

impl PbapSocket {
   /// Opens an L2CAP connection on the given PSM.
   ///
   /// PSM values outside `[1, 30]` fail with
   /// [`PbapError::InvalidTransportParameter`] before any I/O is attempted.
   pub async fn connect_l2cap(address: Address, psm: u16, timeout: Duration) -> Result<Self> {
      validate_channel("PSM", psm)?;

      debug!("Connecting L2CAP to {address} psm {psm}");
      let addr = l2cap::SocketAddr::new(address, AddressType::BrEdr, psm);
      let stream = time::timeout(timeout, l2cap::Stream::connect(addr))
         .await
         .map_err(|_| PbapError::RequestTimeout)??;

      let (reader, writer) = tokio::io::split(stream);
      Ok(Self::from_streams(
         address,
         ConnectionKind::L2cap,
         reader,
         writer,
      ))
   }

   /// Opens an RFCOMM connection on the given channel.
   pub async fn connect_rfcomm(address: Address, channel: u8, timeout: Duration) -> Result<Self> {
      validate_channel("channel", channel.into())?;

      debug!("Connecting RFCOMM to {address} channel {channel}");
      let addr = rfcomm::SocketAddr::new(address, channel);
      let stream = time::timeout(timeout, rfcomm::Stream::connect(addr))
         .await
         .map_err(|_| PbapError::RequestTimeout)??;

      let (reader, writer) = tokio::io::split(stream);
      Ok(Self::from_streams(
         address,
         ConnectionKind::Rfcomm,
         reader,
         writer,
      ))
   }

   /// Builds a socket over caller-supplied streams, in place of an
   /// underlying L2CAP or RFCOMM connection.
   pub fn from_streams<R, W>(remote: Address, kind: ConnectionKind, reader: R, writer: W) -> Self
   where
      R: AsyncRead + Send + Sync + Unpin + 'static,
      W: AsyncWrite + Send + Sync + Unpin + 'static,
   {
      Self {
         remote,
         kind,
         reader: Some(Box::new(reader)),
         writer: Some(Box::new(writer)),
      }
   }

   pub fn remote_device(&self) -> Address {
      self.remote
   }

   pub fn connection_type(&self) -> ConnectionKind {
      self.kind
   }

   pub fn max_transmit_size(&self) -> u16 {
      PBAP_PACKET_SIZE
   }

   pub fn max_receive_size(&self) -> u16 {
      PBAP_PACKET_SIZE
   }

   pub fn is_closed(&self) -> bool {
      self.reader.is_none() && self.writer.is_none()
   }

   pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
      let reader = self.reader.as_mut().ok_or(PbapError::SocketClosed)?;
      Ok(reader.read(buf).await?)
   }

   pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
      let reader = self.reader.as_mut().ok_or(PbapError::SocketClosed)?;
      reader.read_exact(buf).await?;
      Ok(())
   }

   pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
      let writer = self.writer.as_mut().ok_or(PbapError::SocketClosed)?;
      writer.write_all(buf).await?;
      writer.flush().await?;
      Ok(())
   }

   /// Closes both streams. Idempotent; stream shutdown failures are logged
   /// rather than propagated so teardown always completes.
   pub async fn close(&mut self) {
      if let Some(mut writer) = self.writer.take() {
         if let Err(e) = writer.shutdown().await {
            warn!("Error shutting down socket to {}: {e}", self.remote);
         }
      }
      if self.reader.take().is_some() {
         debug!("Closed socket to {}", self.remote);
      }
   }

   /// Drops both streams without a graceful shutdown. Used on abort, where
   /// blocking on the transport is not acceptable.
   pub fn abort(&mut self) {
      self.writer.take();
      if self.reader.take().is_some() {
         debug!("Aborted socket to {}", self.remote);
      }
   }
}

fn validate_channel(what: &str, value: u16) -> Result<()> {
   if CHANNEL_RANGE.contains(&value) {
      Ok(())
   } else {
      Err(PbapError::InvalidTransportParameter(format!(
         "{what} {value} outside [1,30]"
      )))
   }
}

/// Socket factory for the connection handler.
///
/// The BlueZ variant opens real device sockets; the injected variant
/// replays queued outcomes so the handler's transport selection can run
/// without a radio.
pub enum Transport {
   Bluez {
      adapter: Adapter,
      connect_timeout: Duration,
   },
   Injected(InjectedTransport),
}

impl Transport {
   pub async fn is_radio_enabled(&self) -> bool {
      match self {
         Self::Bluez { adapter, .. } => adapter.is_powered().await.unwrap_or(false),
         Self::Injected(inner) => inner.powered,
      }
   }

   pub async fn connect_l2cap(&self, address: Address, psm: u16) -> Result<PbapSocket> {
      match self {
         Self::Bluez {
            connect_timeout, ..
         } => PbapSocket::connect_l2cap(address, psm, *connect_timeout).await,
         Self::Injected(inner) => {
            inner.l2cap_attempts.fetch_add(1, Ordering::Relaxed);
            validate_channel("PSM", psm)?;
            inner.next_outcome(&inner.l2cap)
         },
      }
   }

   pub async fn connect_rfcomm(&self, address: Address, channel: u8) -> Result<PbapSocket> {
      match self {
         Self::Bluez {
            connect_timeout, ..
         } => PbapSocket::connect_rfcomm(address, channel, *connect_timeout).await,
         Self::Injected(inner) => {
            inner.rfcomm_attempts.fetch_add(1, Ordering::Relaxed);
            validate_channel("channel", channel.into())?;
            inner.next_outcome(&inner.rfcomm)
         },
      }
   }
}

/// Replays queued connection outcomes in place of a radio.
pub struct InjectedTransport {
   powered: bool,
   l2cap: parking_lot::Mutex<VecDeque<Result<PbapSocket>>>,
   rfcomm: parking_lot::Mutex<VecDeque<Result<PbapSocket>>>,
   l2cap_attempts: AtomicUsize,
   rfcomm_attempts: AtomicUsize,
}

impl InjectedTransport {
   pub fn new(powered: bool) -> Self {
      Self {
         powered,
         l2cap: parking_lot::Mutex::new(VecDeque::new()),
         rfcomm: parking_lot::Mutex::new(VecDeque::new()),
         l2cap_attempts: AtomicUsize::new(0),
         rfcomm_attempts: AtomicUsize::new(0),
      }
   }

   pub fn push_l2cap(&self, outcome: Result<PbapSocket>) {
      self.l2cap.lock().push_back(outcome);
   }

   pub fn push_rfcomm(&self, outcome: Result<PbapSocket>) {
      self.rfcomm.lock().push_back(outcome);
   }

   pub fn l2cap_attempts(&self) -> usize {
      self.l2cap_attempts.load(Ordering::Relaxed)
   }

   pub fn rfcomm_attempts(&self) -> usize {
      self.rfcomm_attempts.load(Ordering::Relaxed)
   }

   fn next_outcome(
      &self,
      queue: &parking_lot::Mutex<VecDeque<Result<PbapSocket>>>,
   ) -> Result<PbapSocket> {
      queue
         .lock()
         .pop_front()
         .unwrap_or(Err(PbapError::TransportUnavailable))
   }
}

#[cfg(test)]
mod tests {
   use std::{
      pin::Pin,
      sync::{Arc, atomic::AtomicUsize},
      task::{Context, Poll},
   };

   use super::*;

   /// AsyncWrite wrapper that counts shutdown calls.
   struct CountingWriter<W> {
      inner: W,
      shutdowns: Arc<AtomicUsize>,
   }

   impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
      fn poll_write(
         mut self: Pin<&mut Self>,
         cx: &mut Context<'_>,
         buf: &[u8],
      ) -> Poll<std::io::Result<usize>> {
         Pin::new(&mut self.inner).poll_write(cx, buf)
      }

      fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
         Pin::new(&mut self.inner).poll_flush(cx)
      }

      fn poll_shutdown(
         mut self: Pin<&mut Self>,
         cx: &mut Context<'_>,
      ) -> Poll<std::io::Result<()>> {
         self.shutdowns.fetch_add(1, Ordering::Relaxed);
         Pin::new(&mut self.inner).poll_shutdown(cx)
      }
   }

   /// AsyncRead wrapper that counts drops, i.e. stream closes.
   struct CountingReader<R> {
      inner: R,
      drops: Arc<AtomicUsize>,
   }

   impl<R> Drop for CountingReader<R> {
      fn drop(&mut self) {
         self.drops.fetch_add(1, Ordering::Relaxed);
      }
   }

   impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
      fn poll_read(
         mut self: Pin<&mut Self>,
         cx: &mut Context<'_>,
         buf: &mut tokio::io::ReadBuf<'_>,
      ) -> Poll<std::io::Result<()>> {
         Pin::new(&mut self.inner).poll_read(cx, buf)
      }
   }

   fn injected_pair() -> (PbapSocket, tokio::io::DuplexStream) {
      let (near, far) = tokio::io::duplex(1024);
      let (reader, writer) = tokio::io::split(near);
      let socket = PbapSocket::from_streams(Address::any(), ConnectionKind::L2cap, reader, writer);
      (socket, far)
   }

   #[tokio::test]
   async fn invalid_psm_fails_before_io() {
      for psm in [0u16, 31, 0x1021] {
         let err = PbapSocket::connect_l2cap(Address::any(), psm, Duration::from_secs(1))
            .await
            .unwrap_err();
         assert!(matches!(err, PbapError::InvalidTransportParameter(_)));
      }
   }

   #[tokio::test]
   async fn roundtrip_over_injected_streams() {
      let (mut socket, far) = injected_pair();
      let (mut far_read, mut far_write) = tokio::io::split(far);

      socket.write_all(b"ping").await.unwrap();
      let mut buf = [0u8; 4];
      far_read.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"ping");

      far_write.write_all(b"pong").await.unwrap();
      let mut buf = [0u8; 4];
      socket.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"pong");

      assert_eq!(socket.max_transmit_size(), 255);
      assert_eq!(socket.max_receive_size(), 255);
   }

   #[tokio::test]
   async fn close_closes_both_streams_exactly_once() {
      let shutdowns = Arc::new(AtomicUsize::new(0));
      let drops = Arc::new(AtomicUsize::new(0));

      let (near, _far) = tokio::io::duplex(64);
      let (reader, writer) = tokio::io::split(near);
      let reader = CountingReader {
         inner: reader,
         drops: drops.clone(),
      };
      let writer = CountingWriter {
         inner: writer,
         shutdowns: shutdowns.clone(),
      };

      let mut socket = PbapSocket::from_streams(Address::any(), ConnectionKind::Rfcomm, reader, writer);
      socket.close().await;
      socket.close().await;

      assert_eq!(shutdowns.load(Ordering::Relaxed), 1);
      assert_eq!(drops.load(Ordering::Relaxed), 1);
      assert!(socket.is_closed());
   }

   #[tokio::test]
   async fn io_after_close_fails_with_socket_closed() {
      let (mut socket, _far) = injected_pair();
      socket.close().await;

      let mut buf = [0u8; 1];
      assert!(matches!(socket.read(&mut buf).await, Err(PbapError::SocketClosed)));
      assert!(matches!(socket.write_all(b"x").await, Err(PbapError::SocketClosed)));
   }

   #[tokio::test]
   async fn far_end_sees_eof_after_close() {
      let (mut socket, far) = injected_pair();
      socket.close().await;

      let mut far_read = far;
      let mut buf = [0u8; 8];
      let n = far_read.read(&mut buf).await.unwrap();
      assert_eq!(n, 0);
   }

   #[tokio::test]
   async fn injected_transport_replays_outcomes() {
      let transport = InjectedTransport::new(true);
      let (socket, _far) = injected_pair();
      transport.push_l2cap(Ok(socket));

      let transport = Transport::Injected(transport);
      assert!(transport.is_radio_enabled().await);
      assert!(transport.connect_l2cap(Address::any(), 25).await.is_ok());
      // Queue exhausted.
      assert!(matches!(
         transport.connect_l2cap(Address::any(), 25).await,
         Err(PbapError::TransportUnavailable)
      ));
   }
}
