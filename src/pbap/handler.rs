//! Per-device connection handler.
//!
//! One handler owns the full lifecycle of a PBAP connection to a single
//! remote device: transport selection, OBEX session, phonebook download
//! and teardown. Messages are consumed in order by one spawned task; the
//! owning state machine reacts to the signals the handler sends back.
//! A handler is used for one connection cycle and then discarded.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use bluer::Address;
use log::{debug, info, warn};
use strum::Display;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   bluetooth::socket::{PbapSocket, Transport},
   error::{PbapError, Result},
   event::{EventSender, PbapEvent},
   pbap::{
      obex::{AppParams, FORMAT_VCARD_30, ObexSession},
      sdp::{
         PbapSdpRecord, ProfileVersion, REPOSITORY_FAVORITES, REPOSITORY_LOCAL_PHONEBOOK,
         REPOSITORY_SIM_CARD,
      },
      storage::ContactsStorage,
      vcard,
   },
};

// Phonebook object paths, PBAP v1.2.3 Sec. 3.1.2.
pub const LOCAL_PHONEBOOK_PATH: &str = "telecom/pb.vcf";
pub const FAVORITES_PATH: &str = "telecom/fav.vcf";
pub const MISSED_CALLS_PATH: &str = "telecom/mch.vcf";
pub const INCOMING_CALLS_PATH: &str = "telecom/ich.vcf";
pub const OUTGOING_CALLS_PATH: &str = "telecom/och.vcf";
pub const SIM_PHONEBOOK_PATH: &str = "SIM1/telecom/pb.vcf";

const MESSAGE_QUEUE_SIZE: usize = 16;

/// Requests accepted by a handler, processed strictly in order.
#[derive(Debug)]
pub enum HandlerMessage {
   Connect(PbapSdpRecord),
   Download,
   Disconnect,
}

/// Outcomes reported back to the owning state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerSignal {
   ConnectionComplete,
   ConnectionFailed,
   ConnectionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum HandlerState {
   Idle,
   ConnectingSocket,
   SocketConnected,
   ObexSessionActive,
   Disconnecting,
   /// Absorbing; entered from any state, never left.
   Aborted,
}

/// Builds a [`ConnectionHandler`], validating required collaborators up
/// front so a misassembled handler fails at build time instead of at
/// first use.
#[derive(Default)]
pub struct ConnectionHandlerBuilder {
   device: Option<Address>,
   transport: Option<Transport>,
   local_features: Option<u32>,
   signals: Option<mpsc::Sender<HandlerSignal>>,
   events: Option<EventSender>,
   storage: Option<Arc<dyn ContactsStorage>>,
   batch_size: u16,
   default_rfcomm_channel: u8,
}

impl ConnectionHandlerBuilder {
   pub fn new() -> Self {
      Self {
         batch_size: 250,
         default_rfcomm_channel: 19,
         ..Default::default()
      }
   }

   pub fn device(mut self, device: Address) -> Self {
      self.device = Some(device);
      self
   }

   pub fn transport(mut self, transport: Transport) -> Self {
      self.transport = Some(transport);
      self
   }

   pub fn local_features(mut self, features: u32) -> Self {
      self.local_features = Some(features);
      self
   }

   pub fn signals(mut self, signals: mpsc::Sender<HandlerSignal>) -> Self {
      self.signals = Some(signals);
      self
   }

   pub fn events(mut self, events: EventSender) -> Self {
      self.events = Some(events);
      self
   }

   pub fn storage(mut self, storage: Arc<dyn ContactsStorage>) -> Self {
      self.storage = Some(storage);
      self
   }

   pub fn batch_size(mut self, batch_size: u16) -> Self {
      self.batch_size = batch_size;
      self
   }

   pub fn default_rfcomm_channel(mut self, channel: u8) -> Self {
      self.default_rfcomm_channel = channel;
      self
   }

   pub fn build(self) -> Result<ConnectionHandler> {
      Ok(ConnectionHandler {
         device: self
            .device
            .ok_or(PbapError::InvalidConfiguration("device"))?,
         transport: self
            .transport
            .ok_or(PbapError::InvalidConfiguration("transport"))?,
         local_features: self
            .local_features
            .ok_or(PbapError::InvalidConfiguration("local_features"))?,
         signals: self
            .signals
            .ok_or(PbapError::InvalidConfiguration("signals"))?,
         events: self.events,
         storage: self.storage,
         batch_size: self.batch_size.max(1),
         default_rfcomm_channel: self.default_rfcomm_channel,
         aborted: Arc::new(AtomicBool::new(false)),
         state: HandlerState::Idle,
         record: None,
         socket: None,
         session: None,
         closed_sent: true,
      })
   }
}

/// Connection lifecycle state machine for one remote device.
pub struct ConnectionHandler {
   device: Address,
   transport: Transport,
   local_features: u32,
   signals: mpsc::Sender<HandlerSignal>,
   events: Option<EventSender>,
   storage: Option<Arc<dyn ContactsStorage>>,
   batch_size: u16,
   default_rfcomm_channel: u8,
   aborted: Arc<AtomicBool>,
   state: HandlerState,
   record: Option<PbapSdpRecord>,
   socket: Option<PbapSocket>,
   session: Option<ObexSession>,
   closed_sent: bool,
}

impl std::fmt::Debug for ConnectionHandler {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConnectionHandler")
         .field("device", &self.device)
         .field("state", &self.state)
         .finish_non_exhaustive()
   }
}

impl ConnectionHandler {
   pub fn device(&self) -> Address {
      self.device
   }

   pub fn state(&self) -> HandlerState {
      self.state
   }

   /// The live transport socket, if any. `None` once aborted or torn
   /// down.
   pub fn socket(&self) -> Option<&PbapSocket> {
      self
         .socket
         .as_ref()
         .or_else(|| self.session.as_ref().map(ObexSession::socket))
   }

   fn set_state(&mut self, state: HandlerState) {
      debug!("{}: {} -> {state}", self.device, self.state);
      self.state = state;
   }

   /// Opens the transport socket for one connection cycle.
   ///
   /// L2CAP is preferred when the record advertises a valid PSM; RFCOMM
   /// is the fallback both when no PSM is advertised and when the L2CAP
   /// connect itself fails. Returns `false` on any terminal failure,
   /// never an error.
   pub async fn connect_socket(&mut self, record: PbapSdpRecord) -> bool {
      if self.aborted.load(Ordering::SeqCst) || self.state == HandlerState::Aborted {
         return false;
      }
      self.closed_sent = false;
      self.set_state(HandlerState::ConnectingSocket);
      let psm = record.l2cap_psm();
      let channel = record
         .rfcomm_channel()
         .unwrap_or(self.default_rfcomm_channel);
      self.record = Some(record);

      if !self.transport.is_radio_enabled().await {
         warn!("Radio disabled, not connecting to {}", self.device);
         self.set_state(HandlerState::Idle);
         return false;
      }

      if let Some(psm) = psm {
         match self.transport.connect_l2cap(self.device, psm).await {
            Ok(socket) => {
               info!("L2CAP connected to {} on psm {psm}", self.device);
               self.socket = Some(socket);
               self.set_state(HandlerState::SocketConnected);
               return true;
            },
            Err(e) => {
               warn!(
                  "L2CAP connect to {} failed, falling back to RFCOMM: {e}",
                  self.device
               );
            },
         }
      }

      match self.transport.connect_rfcomm(self.device, channel).await {
         Ok(socket) => {
            info!("RFCOMM connected to {} on channel {channel}", self.device);
            self.socket = Some(socket);
            self.set_state(HandlerState::SocketConnected);
            true
         },
         Err(e) => {
            warn!("RFCOMM connect to {} failed: {e}", self.device);
            self.set_state(HandlerState::Idle);
            false
         },
      }
   }

   /// Starts the OBEX session over the connected socket. Guarded: without
   /// a live socket this returns `false` with no transition and no side
   /// effect.
   pub async fn connect_obex_session(&mut self) -> bool {
      if self.state != HandlerState::SocketConnected {
         return false;
      }
      let Some(socket) = self.socket.take() else {
         return false;
      };

      // The supported-features parameter only exists from profile 1.2 on.
      let features = self
         .record
         .as_ref()
         .and_then(PbapSdpRecord::profile_version)
         .filter(|v| *v >= ProfileVersion::V1_2)
         .map(|_| self.local_features);

      let mut session = ObexSession::new(socket, features);
      match session.connect().await {
         Ok(()) => {
            self.session = Some(session);
            self.set_state(HandlerState::ObexSessionActive);
            true
         },
         Err(e) => {
            warn!("OBEX connect to {} failed: {e}", self.device);
            session.close().await;
            self.set_state(HandlerState::Idle);
            false
         },
      }
   }

   /// Pulls every phonebook the remote advertises, then the call
   /// histories. Failures of individual phonebooks are logged and the
   /// rest still downloaded.
   pub async fn download(&mut self) {
      if self.state != HandlerState::ObexSessionActive {
         warn!(
            "Download requested for {} without an active session",
            self.device
         );
         return;
      }
      let Some(record) = self.record.clone() else {
         return;
      };
      if !record.supports_downloading() {
         info!("{} does not support downloading, nothing to pull", self.device);
         return;
      }

      if let Some(storage) = &self.storage {
         storage.create_account(self.device);
      }

      if record.is_repository_supported(REPOSITORY_FAVORITES) {
         if let Err(e) = self.download_phonebook(FAVORITES_PATH, true, false).await {
            warn!("Favorites download from {} failed: {e}", self.device);
         }
      }
      if record.is_repository_supported(REPOSITORY_LOCAL_PHONEBOOK) {
         if let Err(e) = self
            .download_phonebook(LOCAL_PHONEBOOK_PATH, false, true)
            .await
         {
            warn!("Phonebook download from {} failed: {e}", self.device);
         }
      }
      if record.is_repository_supported(REPOSITORY_SIM_CARD) {
         if let Err(e) = self
            .download_phonebook(SIM_PHONEBOOK_PATH, false, true)
            .await
         {
            warn!("SIM phonebook download from {} failed: {e}", self.device);
         }
      }

      for path in [MISSED_CALLS_PATH, INCOMING_CALLS_PATH, OUTGOING_CALLS_PATH] {
         if let Err(e) = self.download_call_log(path).await {
            warn!("Call log download of {path} from {} failed: {e}", self.device);
         }
      }
   }

   /// Pulls one phonebook in batches. The owner's own card occupies index
   /// 0 of the local and SIM phonebooks and is skipped there.
   async fn download_phonebook(&mut self, path: &str, starred: bool, skip_owner: bool) -> Result<()> {
      let session = self
         .session
         .as_mut()
         .ok_or(PbapError::ObexPreconditionFailed)?;

      let size = session
         .pull(path, &AppParams::size_only())
         .await?
         .phonebook_size
         .unwrap_or(0);
      debug!("{path} on {} holds {size} entries", self.device);

      let mut entries = Vec::new();
      for (offset, count) in batch_plan(size, self.batch_size, skip_owner) {
         let params = AppParams {
            format: Some(FORMAT_VCARD_30),
            max_list_count: Some(count),
            list_start_offset: Some(offset),
            ..Default::default()
         };
         let result = session.pull(path, &params).await?;
         let mut batch = vcard::parse_phonebook(&String::from_utf8_lossy(&result.body));
         if starred {
            for entry in &mut batch {
               entry.starred = true;
            }
         }
         entries.extend(batch);
      }

      let count = entries.len();
      if let Some(storage) = &self.storage {
         storage.store_contacts(self.device, path, entries);
      }
      if let Some(events) = &self.events {
         events.emit(
            self.device,
            PbapEvent::PhonebookSynced {
               path: path.into(),
               count,
            },
         );
      }
      info!("Downloaded {count} contacts from {path} on {}", self.device);
      Ok(())
   }

   async fn download_call_log(&mut self, path: &str) -> Result<()> {
      let session = self
         .session
         .as_mut()
         .ok_or(PbapError::ObexPreconditionFailed)?;

      let result = session.pull(path, &AppParams::default()).await?;
      let calls = vcard::parse_call_log(&String::from_utf8_lossy(&result.body));

      let count = calls.len();
      if let Some(storage) = &self.storage {
         storage.store_call_log(self.device, path, calls);
      }
      if let Some(events) = &self.events {
         events.emit(
            self.device,
            PbapEvent::CallLogSynced {
               path: path.into(),
               count,
            },
         );
      }
      info!("Downloaded {count} calls from {path} on {}", self.device);
      Ok(())
   }

   /// Tears the connection down in order: OBEX disconnect, socket close,
   /// stored call history removal, then exactly one `ConnectionClosed`
   /// signal for the cycle.
   pub async fn disconnect(&mut self) {
      if self.state == HandlerState::Aborted {
         return;
      }
      self.set_state(HandlerState::Disconnecting);

      if let Some(session) = self.session.take() {
         session.close().await;
      }
      if let Some(mut socket) = self.socket.take() {
         socket.close().await;
      }
      self.remove_call_log();
      self.set_state(HandlerState::Idle);
      self.signal_closed().await;
   }

   /// Immediate teardown: discards the socket without a graceful shutdown
   /// and enters the absorbing `Aborted` state. Idempotent, never fails.
   pub fn abort(&mut self) {
      if self.state == HandlerState::Aborted {
         return;
      }
      self.aborted.store(true, Ordering::SeqCst);
      if let Some(session) = self.session.take() {
         session.abort();
      }
      if let Some(mut socket) = self.socket.take() {
         socket.abort();
      }
      self.set_state(HandlerState::Aborted);
   }

   /// Drops stored call history for this device. A no-op when no storage
   /// collaborator is attached.
   fn remove_call_log(&self) {
      let Some(storage) = &self.storage else {
         debug!("No storage attached, keeping call logs for {}", self.device);
         return;
      };
      for path in [MISSED_CALLS_PATH, INCOMING_CALLS_PATH, OUTGOING_CALLS_PATH] {
         storage.remove_call_log(self.device, path);
      }
   }

   async fn send_signal(&self, signal: HandlerSignal) {
      if self.signals.send(signal).await.is_err() {
         debug!("Owner of {} handler is gone, dropping {signal:?}", self.device);
      }
   }

   async fn signal_closed(&mut self) {
      if self.closed_sent {
         return;
      }
      self.closed_sent = true;
      self.send_signal(HandlerSignal::ConnectionClosed).await;
   }
}

/// Compute the `(offset, count)` pull windows covering a phonebook of
/// `size` entries. Index 0 holds the owner's card and is excluded when
/// `skip_owner` is set.
fn batch_plan(size: u16, batch_size: u16, skip_owner: bool) -> Vec<(u16, u16)> {
   let mut plan = Vec::new();
   let mut offset = skip_owner as u16;
   while offset < size {
      let count = (size - offset).min(batch_size.max(1));
      plan.push((offset, count));
      offset += count;
   }
   plan
}

/// Owning handle to a spawned handler task.
pub struct HandlerHandle {
   inbox: mpsc::Sender<HandlerMessage>,
   task: JoinHandle<()>,
   aborted: Arc<AtomicBool>,
}

impl HandlerHandle {
   /// Spawns the handler's message loop.
   pub fn spawn(handler: ConnectionHandler) -> Self {
      let (inbox, rx) = mpsc::channel(MESSAGE_QUEUE_SIZE);
      let aborted = handler.aborted.clone();
      let task = tokio::spawn(run(handler, rx));
      Self {
         inbox,
         task,
         aborted,
      }
   }

   pub async fn send(&self, message: HandlerMessage) -> Result<()> {
      self
         .inbox
         .send(message)
         .await
         .map_err(|_| PbapError::ConnectionClosed)
   }

   /// Interrupts the handler task wherever it is, including mid-transfer.
   /// Dropping the task drops the handler and with it the socket streams.
   /// Idempotent.
   pub fn abort(&self) {
      self.aborted.store(true, Ordering::SeqCst);
      self.task.abort();
   }

   pub fn is_aborted(&self) -> bool {
      self.aborted.load(Ordering::SeqCst)
   }

   /// Waits for the handler task to finish. Abort cancellation is not an
   /// error.
   pub async fn join(self) {
      let _ = self.task.await;
   }
}

async fn run(mut handler: ConnectionHandler, mut inbox: mpsc::Receiver<HandlerMessage>) {
   while let Some(message) = inbox.recv().await {
      match message {
         HandlerMessage::Connect(record) => {
            let connected =
               handler.connect_socket(record).await && handler.connect_obex_session().await;
            if connected {
               handler.send_signal(HandlerSignal::ConnectionComplete).await;
            } else {
               handler.send_signal(HandlerSignal::ConnectionFailed).await;
            }
         },
         HandlerMessage::Download => handler.download().await,
         HandlerMessage::Disconnect => {
            handler.disconnect().await;
            break;
         },
      }
   }

   // Inbox dropped mid-cycle: tear down whatever is still open.
   if !matches!(handler.state, HandlerState::Idle | HandlerState::Aborted) {
      handler.disconnect().await;
   }
}
