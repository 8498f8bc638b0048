//! Configuration management for the PBAP client service.
//!
//! This module handles loading and saving configuration from disk,
//! including download tuning, per-device SDP overrides and persisted
//! connection policies.

use std::{collections::HashMap, env, fs, path::Path, path::PathBuf};

use bluer::Address;
use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::manager::ConnectionPolicy,
   error::{PbapError, Result},
   pbap::sdp::ProfileVersion,
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   /// Contacts pulled per OBEX request. Larger batches download faster,
   /// smaller batches lose less work when the transport drops mid-pull.
   #[serde(default = "default_batch_size")]
   pub batch_size: u16,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   /// RFCOMM channel used when the remote SDP record does not carry one.
   #[serde(default = "default_rfcomm_channel")]
   pub default_rfcomm_channel: u8,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Connection policy per device address, persisted across restarts.
   #[serde(default)]
   pub policies: HashMap<String, ConnectionPolicy>,
}

/// Per-device SDP overrides for remotes whose records BlueZ cannot expose.
#[derive(Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,

   #[serde(default)]
   pub name: Option<String>,

   #[serde(default)]
   pub l2cap_psm: Option<u16>,

   #[serde(default)]
   pub rfcomm_channel: Option<u8>,

   #[serde(default)]
   pub features: Option<u32>,

   #[serde(default)]
   pub repositories: Option<u32>,

   #[serde(default)]
   pub profile_version: Option<ProfileVersion>,
}

const fn default_batch_size() -> u16 {
   250
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_rfcomm_channel() -> u8 {
   19
}

impl Default for Config {
   fn default() -> Self {
      Self {
         batch_size: default_batch_size(),
         connect_timeout_sec: default_connect_timeout(),
         default_rfcomm_channel: default_rfcomm_channel(),
         known_devices: vec![],
         policies: HashMap::new(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub(crate) fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   /// Path the configuration is persisted at.
   pub fn default_path() -> Result<PathBuf> {
      Self::config_path()
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(pbap_home) = env::var("PBAPCLIENT_HOME") {
         PathBuf::from(pbap_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(PbapError::ConfigDirNotFound);
      };

      Ok(config_dir.join("pbapclient").join("config.toml"))
   }

   /// Returns the SDP overrides for a known device, if any.
   pub fn known_device(&self, address: Address) -> Option<&KnownDevice> {
      let address = address.to_string();
      self.known_devices.iter().find(|d| d.address == address)
   }

   /// Returns the persisted connection policy for a device.
   pub fn policy_for(&self, address: Address) -> ConnectionPolicy {
      self
         .policies
         .get(&address.to_string())
         .copied()
         .unwrap_or(ConnectionPolicy::Unknown)
   }

   /// Records a connection policy for a device. The caller persists with
   /// [`Config::save`].
   pub fn set_policy(&mut self, address: Address, policy: ConnectionPolicy) {
      self.policies.insert(address.to_string(), policy);
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn roundtrip_through_disk() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let mut config = Config::default();
      config.set_policy(Address::any(), ConnectionPolicy::Forbidden);
      config.known_devices.push(KnownDevice {
         address: "AA:BB:CC:DD:EE:FF".to_string(),
         name: Some("Car".to_string()),
         l2cap_psm: Some(25),
         rfcomm_channel: None,
         features: Some(0x3),
         repositories: None,
         profile_version: Some(ProfileVersion::V1_2),
      });
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded.batch_size, 250);
      assert_eq!(loaded.policy_for(Address::any()), ConnectionPolicy::Forbidden);

      let known = loaded
         .known_device("AA:BB:CC:DD:EE:FF".parse().unwrap())
         .expect("known device lost");
      assert_eq!(known.l2cap_psm, Some(25));
      assert_eq!(known.profile_version, Some(ProfileVersion::V1_2));
   }

   #[test]
   fn missing_file_creates_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("sub").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert!(path.exists());
      assert_eq!(config.default_rfcomm_channel, 19);
      assert_eq!(config.policy_for(Address::any()), ConnectionPolicy::Unknown);
   }

   #[test]
   fn unknown_device_has_no_overrides() {
      let config = Config::default();
      assert!(config.known_device(Address::any()).is_none());
   }
}
