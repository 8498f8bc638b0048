//! PBAP client D-Bus service.
//!
//! This daemon implements the client role of the Bluetooth Phone Book
//! Access Profile: it connects to remote phonebook servers (typically
//! phones), downloads their contacts and call history over OBEX, and
//! exposes the results and the connection lifecycle over D-Bus.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::PbapClientManager;
use dbus::PbapClientService;
use event::{EventBus, PbapEvent};
use pbap::storage::MemoryStorage;

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod pbap;

use crate::{dbus::PbapClientServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting pbapclient D-Bus service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let event_bus = EventProcessor::new();
   let storage = Arc::new(MemoryStorage::new());

   let manager = PbapClientManager::new(event_bus.clone(), config, storage.clone()).await?;

   let service = PbapClientService::new(manager.clone(), storage);

   let connection = connection::Builder::session()?
      .name("org.pbapclient")?
      .serve_at("/org/pbapclient/manager", service)?
      .build()
      .await?;

   info!("pbapclient D-Bus service started at org.pbapclient");

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down pbapclient service...");
   manager.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Address, PbapEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<(Address, PbapEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<PbapClientService>,
      (address, event): (Address, PbapEvent),
   ) -> Result<()> {
      let addr_str = address.to_string();
      match event {
         PbapEvent::ConnectionStateChanged(state) => {
            iface
               .connection_state_changed(&addr_str, &state.to_string())
               .await?;
         },
         PbapEvent::PhonebookSynced { path, count } => {
            iface
               .phonebook_synced(&addr_str, &path, count as u32)
               .await?;
         },
         PbapEvent::CallLogSynced { path, count } => {
            iface
               .call_log_synced(&addr_str, &path, count as u32)
               .await?;
         },
         PbapEvent::DeviceError => {
            iface.device_error(&addr_str).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, PbapClientService>("/org/pbapclient/manager")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: Address, event: PbapEvent) {
      self.queue.push((device, event));
      self.notifier.notify_waiters();
   }
}
