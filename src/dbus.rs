use std::{str::FromStr, sync::Arc};

use bluer::Address;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::manager::{ConnectionPolicy, ConnectionState, PbapClientManager},
   pbap::storage::MemoryStorage,
};

pub struct PbapClientService {
   manager: PbapClientManager,
   storage: Arc<MemoryStorage>,
}

impl PbapClientService {
   pub const fn new(manager: PbapClientManager, storage: Arc<MemoryStorage>) -> Self {
      Self { manager, storage }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.pbapclient")]
impl PbapClientService {
   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      Ok(self.manager.connect(parse_address(&address)?).await)
   }

   async fn disconnect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      Ok(self.manager.disconnect(parse_address(&address)?).await)
   }

   async fn get_connection_state(&self, address: String) -> zbus::fdo::Result<String> {
      let state = self
         .manager
         .get_connection_state(parse_address(&address)?)
         .await;
      Ok(state.to_string())
   }

   async fn get_connected_devices(&self) -> Vec<String> {
      self
         .manager
         .get_connected_devices()
         .await
         .into_iter()
         .map(|addr| addr.to_string())
         .collect()
   }

   async fn get_devices_matching_connection_states(
      &self,
      states: Vec<String>,
   ) -> zbus::fdo::Result<Vec<String>> {
      let states = states
         .iter()
         .map(|s| {
            ConnectionState::from_str(s)
               .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown state: {s}")))
         })
         .collect::<zbus::fdo::Result<Vec<_>>>()?;

      Ok(
         self
            .manager
            .get_devices_matching_connection_states(states)
            .await
            .into_iter()
            .map(|addr| addr.to_string())
            .collect(),
      )
   }

   async fn set_connection_policy(
      &self,
      address: String,
      policy: String,
   ) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let policy = ConnectionPolicy::from_str(&policy)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown policy: {policy}")))?;
      Ok(self.manager.set_connection_policy(addr, policy).await)
   }

   async fn get_connection_policy(&self, address: String) -> zbus::fdo::Result<String> {
      let policy = self
         .manager
         .get_connection_policy(parse_address(&address)?)
         .await;
      Ok(policy.to_string())
   }

   async fn get_contacts(&self, address: String, path: String) -> zbus::fdo::Result<String> {
      let contacts = self.storage.contacts(parse_address(&address)?, &path);
      serde_json::to_string(&contacts).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn get_call_log(&self, address: String, path: String) -> zbus::fdo::Result<String> {
      let calls = self.storage.call_log(parse_address(&address)?, &path);
      serde_json::to_string(&calls).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn phonebook_synced(
      emitter: &SignalEmitter<'_>,
      address: &str,
      path: &str,
      count: u32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn call_log_synced(
      emitter: &SignalEmitter<'_>,
      address: &str,
      path: &str,
      count: u32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn connected_devices(&self) -> Vec<String> {
      self.get_connected_devices().await
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.manager.get_connected_devices().await.len() as u32
   }
}
