//! PBAP client profile manager.
//!
//! This module tracks every remote phonebook server the service talks
//! to, drives the per-device connection handlers and enforces the
//! persisted connection policies. All state lives in one actor task;
//! the public [`PbapClientManager`] facade sends commands into its inbox
//! and maps a dead actor to safe disabled defaults.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, Session, Uuid};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
};

use crate::{
   bluetooth::socket::Transport,
   config::Config,
   error::{PbapError, Result},
   event::{EventSender, PbapEvent},
   pbap::{
      handler::{
         ConnectionHandlerBuilder, HandlerHandle, HandlerMessage, HandlerSignal,
      },
      sdp::{LOCAL_SUPPORTED_FEATURES, PbapSdpRecord},
      storage::ContactsStorage,
   },
};

/// Service class UUID of the remote Phone Book Server Equipment role.
pub const PBAP_PSE_UUID: Uuid = Uuid::from_u128(0x0000112f_0000_1000_8000_00805f9b34fb);

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Per-device connection lifecycle, as visible to D-Bus clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

/// Whether the profile may connect to a device. Persisted in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionPolicy {
   Unknown,
   Allowed,
   Forbidden,
}

/// Makes one transport per connection attempt.
pub type TransportFactory = Box<dyn Fn() -> Transport + Send + Sync>;

struct ManagedDevice {
   state: ConnectionState,
   handle: Option<HandlerHandle>,
   forwarder: Option<JoinHandle<()>>,
}

impl ManagedDevice {
   fn disconnected() -> Self {
      Self {
         state: ConnectionState::Disconnected,
         handle: None,
         forwarder: None,
      }
   }
}

#[derive(Debug)]
enum ManagerCommand {
   Connect(Address, oneshot::Sender<bool>),
   Disconnect(Address, oneshot::Sender<bool>),
   GetConnectionState(Address, oneshot::Sender<ConnectionState>),
   GetConnectedDevices(oneshot::Sender<Vec<Address>>),
   GetDevicesMatchingStates(Vec<ConnectionState>, oneshot::Sender<Vec<Address>>),
   SetPolicy(Address, ConnectionPolicy, oneshot::Sender<bool>),
   GetPolicy(Address, oneshot::Sender<ConnectionPolicy>),

   // Handler signals, forwarded from per-device signal channels
   HandlerSignal(Address, HandlerSignal),

   // Adapter events
   DeviceRemoved(Address),

   Shutdown,
}

/// Public handle to the profile manager actor.
///
/// Every method degrades to its disabled default once the actor is gone:
/// `false` for the boolean operations, empty lists, `Disconnected` and
/// `Unknown` for the queries.
#[derive(Clone)]
pub struct PbapClientManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl PbapClientManager {
   /// Connects to BlueZ and spawns the manager actor.
   pub async fn new(
      event_tx: EventSender,
      config: Config,
      storage: Arc<dyn ContactsStorage>,
   ) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      info!("Using Bluetooth adapter {}", adapter.name());

      let connect_timeout = Duration::from_secs(config.connect_timeout_sec);
      let factory_adapter = adapter.clone();
      let transport_factory: TransportFactory = Box::new(move || Transport::Bluez {
         adapter: factory_adapter.clone(),
         connect_timeout,
      });

      let config_path = Config::default_path().ok();
      Ok(spawn_actor(
         config,
         event_tx,
         storage,
         Some(adapter),
         transport_factory,
         config_path,
      ))
   }

   /// Initiates a connection. `false` when the policy forbids it, the
   /// device advertises no phonebook service, or a cycle is already
   /// running.
   pub async fn connect(&self, address: Address) -> bool {
      self.request_bool(|tx| ManagerCommand::Connect(address, tx)).await
   }

   /// Initiates an orderly disconnect. `false` when no connection cycle
   /// is active for the device.
   pub async fn disconnect(&self, address: Address) -> bool {
      self
         .request_bool(|tx| ManagerCommand::Disconnect(address, tx))
         .await
   }

   pub async fn get_connection_state(&self, address: Address) -> ConnectionState {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetConnectionState(address, tx))
         .await
         .is_err()
      {
         return ConnectionState::Disconnected;
      }
      rx.await.unwrap_or(ConnectionState::Disconnected)
   }

   pub async fn get_connected_devices(&self) -> Vec<Address> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetConnectedDevices(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn get_devices_matching_connection_states(
      &self,
      states: Vec<ConnectionState>,
   ) -> Vec<Address> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetDevicesMatchingStates(states, tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn set_connection_policy(&self, address: Address, policy: ConnectionPolicy) -> bool {
      self
         .request_bool(|tx| ManagerCommand::SetPolicy(address, policy, tx))
         .await
   }

   pub async fn get_connection_policy(&self, address: Address) -> ConnectionPolicy {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetPolicy(address, tx))
         .await
         .is_err()
      {
         return ConnectionPolicy::Unknown;
      }
      rx.await.unwrap_or(ConnectionPolicy::Unknown)
   }

   /// Stops the actor after tearing down every connection. Calls made
   /// after this return the disabled defaults.
   pub async fn shutdown(&self) {
      let _ = self.inbox.send(ManagerCommand::Shutdown).await;
      self.inbox.closed().await;
   }

   async fn request_bool(&self, make: impl FnOnce(oneshot::Sender<bool>) -> ManagerCommand) -> bool {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(make(tx)).await.is_err() {
         return false;
      }
      rx.await.unwrap_or(false)
   }
}

fn spawn_actor(
   config: Config,
   event_tx: EventSender,
   storage: Arc<dyn ContactsStorage>,
   adapter: Option<Adapter>,
   transport_factory: TransportFactory,
   config_path: Option<PathBuf>,
) -> PbapClientManager {
   let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
   let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

   let actor = ManagerActor {
      config,
      event_tx,
      command_rx,
      loopback_rx,
      loopback_tx,
      adapter,
      transport_factory,
      storage,
      config_path,
      devices: HashMap::new(),
   };
   tokio::spawn(actor.run());

   PbapClientManager { inbox: command_tx }
}

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   adapter: Option<Adapter>,
   transport_factory: TransportFactory,
   storage: Arc<dyn ContactsStorage>,
   config_path: Option<PathBuf>,

   devices: HashMap<Address, ManagedDevice>,
}

impl ManagerActor {
   async fn run(mut self) {
      info!("PBAP client manager starting up");

      let monitor = self
         .adapter
         .clone()
         .map(|adapter| Self::start_adapter_monitor(self.loopback_tx.clone(), adapter));

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("PBAP client manager shutting down");
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
            Some(cmd) = self.loopback_rx.recv() => {
               if !self.handle_command(cmd).await {
                  break;
               }
            }
         }
      }

      if let Some(monitor) = monitor {
         monitor.abort();
      }
      self.cleanup().await;
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            warn!("Failed to get adapter events, device removal goes unnoticed");
            return;
         };
         while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceRemoved(addr) = event {
               let _ = loopback.send(ManagerCommand::DeviceRemoved(addr)).await;
            }
         }
      })
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::Connect(addr, reply) => {
            let result = self.handle_connect(addr).await;
            if let Err(e) = &result {
               warn!("Connect to {addr} refused: {e}");
            }
            let _ = reply.send(result.is_ok());
         },
         ManagerCommand::Disconnect(addr, reply) => {
            let _ = reply.send(self.handle_disconnect(addr).await);
         },
         ManagerCommand::GetConnectionState(addr, reply) => {
            let state = self
               .devices
               .get(&addr)
               .map_or(ConnectionState::Disconnected, |d| d.state);
            let _ = reply.send(state);
         },
         ManagerCommand::GetConnectedDevices(reply) => {
            let _ = reply.send(self.devices_in(&[ConnectionState::Connected]));
         },
         ManagerCommand::GetDevicesMatchingStates(states, reply) => {
            let _ = reply.send(self.devices_in(&states));
         },
         ManagerCommand::SetPolicy(addr, policy, reply) => {
            let _ = reply.send(self.handle_set_policy(addr, policy).await);
         },
         ManagerCommand::GetPolicy(addr, reply) => {
            let _ = reply.send(self.config.policy_for(addr));
         },
         ManagerCommand::HandlerSignal(addr, signal) => {
            self.handle_signal(addr, signal).await;
         },
         ManagerCommand::DeviceRemoved(addr) => {
            if self.devices.get(&addr).is_some_and(|d| d.handle.is_some()) {
               warn!("{addr} removed while a connection cycle was active, aborting");
               self.discard_handler(addr);
               self.storage.remove_account(addr);
               self.set_state(addr, ConnectionState::Disconnected);
            }
         },
         ManagerCommand::Shutdown => return false,
      }
      true
   }

   fn devices_in(&self, states: &[ConnectionState]) -> Vec<Address> {
      self
         .devices
         .iter()
         .filter(|(_, d)| states.contains(&d.state))
         .map(|(addr, _)| *addr)
         .collect()
   }

   async fn handle_connect(&mut self, addr: Address) -> Result<()> {
      if self.config.policy_for(addr) == ConnectionPolicy::Forbidden {
         return Err(PbapError::PolicyForbidden);
      }
      if self
         .devices
         .get(&addr)
         .is_some_and(|d| d.state != ConnectionState::Disconnected)
      {
         return Err(PbapError::AlreadyConnecting);
      }

      let record = self
         .resolve_record(addr)
         .await
         .ok_or(PbapError::DeviceNotFound(addr))?;

      let (signal_tx, mut signal_rx) = mpsc::channel(8);
      let handler = ConnectionHandlerBuilder::new()
         .device(addr)
         .transport((self.transport_factory)())
         .local_features(LOCAL_SUPPORTED_FEATURES)
         .signals(signal_tx)
         .storage(self.storage.clone())
         .batch_size(self.config.batch_size)
         .default_rfcomm_channel(self.config.default_rfcomm_channel)
         .build()?;
      let handle = HandlerHandle::spawn(handler);

      // Forward handler signals into the actor's loopback so all state
      // changes go through one place.
      let loopback = self.loopback_tx.clone();
      let forwarder = tokio::spawn(async move {
         while let Some(signal) = signal_rx.recv().await {
            if loopback
               .send(ManagerCommand::HandlerSignal(addr, signal))
               .await
               .is_err()
            {
               return;
            }
         }
      });

      if handle.send(HandlerMessage::Connect(record)).await.is_err() {
         handle.abort();
         forwarder.abort();
         return Err(PbapError::ConnectionClosed);
      }

      let device = self
         .devices
         .entry(addr)
         .or_insert_with(ManagedDevice::disconnected);
      device.handle = Some(handle);
      device.forwarder = Some(forwarder);
      self.set_state(addr, ConnectionState::Connecting);
      Ok(())
   }

   async fn handle_disconnect(&mut self, addr: Address) -> bool {
      let Some(device) = self.devices.get_mut(&addr) else {
         return false;
      };
      let Some(handle) = &device.handle else {
         return false;
      };

      if handle.send(HandlerMessage::Disconnect).await.is_err() {
         // Handler task already gone; clean up directly.
         self.discard_handler(addr);
         self.set_state(addr, ConnectionState::Disconnected);
         return true;
      }
      self.set_state(addr, ConnectionState::Disconnecting);
      true
   }

   async fn handle_signal(&mut self, addr: Address, signal: HandlerSignal) {
      debug!("Handler signal from {addr}: {signal:?}");
      match signal {
         HandlerSignal::ConnectionComplete => {
            self.set_state(addr, ConnectionState::Connected);
            if let Some(handle) = self.devices.get(&addr).and_then(|d| d.handle.as_ref())
               && handle.send(HandlerMessage::Download).await.is_err()
            {
               warn!("Handler for {addr} gone before download could start");
            }
         },
         HandlerSignal::ConnectionFailed => {
            self.event_tx.emit(addr, PbapEvent::DeviceError);
            // Run the teardown path so the cycle ends with ConnectionClosed.
            self.set_state(addr, ConnectionState::Disconnecting);
            if let Some(handle) = self.devices.get(&addr).and_then(|d| d.handle.as_ref()) {
               let _ = handle.send(HandlerMessage::Disconnect).await;
            }
         },
         HandlerSignal::ConnectionClosed => {
            // Handlers are single-use; never reattach one.
            self.discard_handler(addr);
            self.storage.remove_account(addr);
            self.set_state(addr, ConnectionState::Disconnected);
         },
      }
   }

   async fn handle_set_policy(&mut self, addr: Address, policy: ConnectionPolicy) -> bool {
      info!("Connection policy for {addr}: {policy}");
      self.config.set_policy(addr, policy);
      if let Some(path) = &self.config_path
         && let Err(e) = self.config.save_to(path)
      {
         error!("Failed to persist connection policy: {e}");
      }

      if policy == ConnectionPolicy::Forbidden
         && self
            .devices
            .get(&addr)
            .is_some_and(|d| d.state != ConnectionState::Disconnected)
      {
         self.handle_disconnect(addr).await;
      }
      true
   }

   /// Resolves the remote PBAP record: config overrides first, then the
   /// BlueZ service UUID list.
   async fn resolve_record(&self, addr: Address) -> Option<PbapSdpRecord> {
      if let Some(known) = self.config.known_device(addr) {
         return Some(PbapSdpRecord::from_overrides(addr, known));
      }

      let adapter = self.adapter.as_ref()?;
      let device = adapter.device(addr).ok()?;
      let uuids = device.uuids().await.ok().flatten().unwrap_or_default();
      if uuids.contains(&PBAP_PSE_UUID) {
         Some(PbapSdpRecord::with_defaults(addr))
      } else {
         warn!("{addr} does not advertise a phonebook server");
         None
      }
   }

   fn discard_handler(&mut self, addr: Address) {
      if let Some(device) = self.devices.get_mut(&addr) {
         if let Some(handle) = device.handle.take() {
            handle.abort();
         }
         if let Some(forwarder) = device.forwarder.take() {
            forwarder.abort();
         }
      }
   }

   fn set_state(&mut self, addr: Address, state: ConnectionState) {
      let device = self
         .devices
         .entry(addr)
         .or_insert_with(ManagedDevice::disconnected);
      if device.state != state {
         debug!("{addr}: {} -> {state}", device.state);
         device.state = state;
         self
            .event_tx
            .emit(addr, PbapEvent::ConnectionStateChanged(state));
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up PBAP client manager");
      let addrs: Vec<Address> = self.devices.keys().copied().collect();
      for addr in addrs {
         self.discard_handler(addr);
      }
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;
   use tokio::{
      io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
      time,
   };

   use super::*;
   use crate::{
      bluetooth::socket::{ConnectionKind, InjectedTransport, PbapSocket},
      config::KnownDevice,
      event::{EventBus, PbapEvent},
      pbap::storage::MemoryStorage,
   };

   const DEVICE: Address = Address::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);

   struct RecordingBus(Mutex<Vec<(Address, PbapEvent)>>);

   impl EventBus for RecordingBus {
      fn emit(&self, device: Address, event: PbapEvent) {
         self.0.lock().push((device, event));
      }
   }

   fn known_device_config() -> Config {
      let mut config = Config::default();
      config.known_devices.push(KnownDevice {
         address: DEVICE.to_string(),
         name: None,
         l2cap_psm: None,
         rfcomm_channel: Some(4),
         features: None,
         repositories: None,
         profile_version: None,
      });
      config
   }

   fn spawn_test_manager(
      config: Config,
      storage: Arc<MemoryStorage>,
      transport_factory: TransportFactory,
   ) -> PbapClientManager {
      spawn_actor(
         config,
         Arc::new(RecordingBus(Mutex::new(Vec::new()))),
         storage,
         None,
         transport_factory,
         None,
      )
   }

   fn failing_factory() -> TransportFactory {
      Box::new(|| Transport::Injected(InjectedTransport::new(true)))
   }

   async fn wait_for_state(manager: &PbapClientManager, addr: Address, want: ConnectionState) {
      for _ in 0..200 {
         if manager.get_connection_state(addr).await == want {
            return;
         }
         time::sleep(Duration::from_millis(5)).await;
      }
      panic!("device never reached {want}");
   }

   #[tokio::test]
   async fn defaults_after_shutdown() {
      let manager = spawn_test_manager(
         Config::default(),
         Arc::new(MemoryStorage::new()),
         failing_factory(),
      );
      manager.shutdown().await;

      assert!(!manager.connect(DEVICE).await);
      assert!(!manager.disconnect(DEVICE).await);
      assert_eq!(
         manager.get_connection_state(DEVICE).await,
         ConnectionState::Disconnected
      );
      assert!(manager.get_connected_devices().await.is_empty());
      assert!(
         manager
            .get_devices_matching_connection_states(vec![ConnectionState::Disconnected])
            .await
            .is_empty()
      );
      assert!(
         !manager
            .set_connection_policy(DEVICE, ConnectionPolicy::Allowed)
            .await
      );
      assert_eq!(
         manager.get_connection_policy(DEVICE).await,
         ConnectionPolicy::Unknown
      );
   }

   #[tokio::test]
   async fn forbidden_policy_refuses_connect() {
      let mut config = known_device_config();
      config.set_policy(DEVICE, ConnectionPolicy::Forbidden);

      let manager =
         spawn_test_manager(config, Arc::new(MemoryStorage::new()), failing_factory());
      assert!(!manager.connect(DEVICE).await);
      assert_eq!(
         manager.get_connection_policy(DEVICE).await,
         ConnectionPolicy::Forbidden
      );
   }

   #[tokio::test]
   async fn unknown_device_without_adapter_fails() {
      let manager = spawn_test_manager(
         Config::default(),
         Arc::new(MemoryStorage::new()),
         failing_factory(),
      );
      assert!(!manager.connect(DEVICE).await);
   }

   #[tokio::test]
   async fn failed_transport_ends_cycle_disconnected() {
      let manager = spawn_test_manager(
         known_device_config(),
         Arc::new(MemoryStorage::new()),
         failing_factory(),
      );

      assert!(manager.connect(DEVICE).await);
      wait_for_state(&manager, DEVICE, ConnectionState::Disconnected).await;
      assert!(manager.get_connected_devices().await.is_empty());
   }

   // Minimal scripted phonebook server: every request gets the next
   // canned response.
   async fn fake_pse(mut far: DuplexStream, responses: Vec<Vec<u8>>) {
      for resp in responses {
         let mut head = [0u8; 3];
         if far.read_exact(&mut head).await.is_err() {
            return;
         }
         let len = u16::from_be_bytes([head[1], head[2]]) as usize;
         let mut rest = vec![0u8; len - 3];
         if far.read_exact(&mut rest).await.is_err() {
            return;
         }
         if far.write_all(&resp).await.is_err() {
            return;
         }
      }
   }

   fn response(code: u8, extra: &[u8]) -> Vec<u8> {
      let mut pkt = vec![code, 0, 0];
      pkt.extend_from_slice(extra);
      let len = pkt.len() as u16;
      pkt[1..3].copy_from_slice(&len.to_be_bytes());
      pkt
   }

   fn header(id: u8, data: &[u8]) -> Vec<u8> {
      let mut out = vec![id];
      out.extend_from_slice(&((data.len() as u16 + 3).to_be_bytes()));
      out.extend_from_slice(data);
      out
   }

   #[tokio::test]
   async fn full_connect_download_disconnect_cycle() {
      let success = 0xA0;
      let responses = vec![
         response(success, &[0x10, 0, 0x04, 0x00]),
         // Phonebook size 0: nothing to pull.
         response(success, &header(0x4C, &[0x08, 2, 0, 0])),
         // mch, ich, och: empty.
         response(success, &header(0x49, b"")),
         response(success, &header(0x49, b"")),
         response(success, &header(0x49, b"")),
         // Disconnect.
         response(success, &[]),
      ];

      let transport_factory: TransportFactory = Box::new(move || {
         let (near, far) = tokio::io::duplex(8192);
         let (reader, writer) = tokio::io::split(near);
         let socket = PbapSocket::from_streams(DEVICE, ConnectionKind::Rfcomm, reader, writer);
         tokio::spawn(fake_pse(far, responses.clone()));

         let transport = InjectedTransport::new(true);
         transport.push_rfcomm(Ok(socket));
         Transport::Injected(transport)
      });

      let storage = Arc::new(MemoryStorage::new());
      let manager = spawn_test_manager(known_device_config(), storage.clone(), transport_factory);

      assert!(manager.connect(DEVICE).await);
      // A second connect during the running cycle is refused.
      assert!(!manager.connect(DEVICE).await);

      wait_for_state(&manager, DEVICE, ConnectionState::Connected).await;
      assert_eq!(manager.get_connected_devices().await, vec![DEVICE]);

      assert!(manager.disconnect(DEVICE).await);
      wait_for_state(&manager, DEVICE, ConnectionState::Disconnected).await;
      // Account removed with the connection.
      assert!(!storage.has_account(DEVICE));

      // The handler is single-use; a fresh cycle gets a fresh one.
      assert!(!manager.disconnect(DEVICE).await);
   }
}
