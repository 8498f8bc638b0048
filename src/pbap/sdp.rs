//! Remote PBAP service record.
//!
//! An immutable snapshot of the capabilities a remote phonebook server
//! advertises through service discovery: supported features, supported
//! repositories, profile version and transport parameters. A record is
//! built once per device and replaced wholesale on rediscovery.

use bluer::Address;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::config::KnownDevice;

// Feature bits, PBAP v1.2.3 Sec. 7.1.1.
pub const FEATURE_DOWNLOADING: u32 = 1 << 0;
pub const FEATURE_BROWSING: u32 = 1 << 1;
pub const FEATURE_DATABASE_IDENTIFIER: u32 = 1 << 2;
pub const FEATURE_FOLDER_VERSION_COUNTERS: u32 = 1 << 3;
pub const FEATURE_VCARD_SELECTING: u32 = 1 << 4;
pub const FEATURE_ENHANCED_MISSED_CALLS: u32 = 1 << 5;
pub const FEATURE_XBT_UCI_VCARD_PROPERTY: u32 = 1 << 6;
pub const FEATURE_XBT_UID_VCARD_PROPERTY: u32 = 1 << 7;
pub const FEATURE_CONTACT_REFERENCING: u32 = 1 << 8;
pub const FEATURE_DEFAULT_IMAGE_FORMAT: u32 = 1 << 9;

// Repository bits, PBAP v1.2.3 Sec. 7.1.2.
pub const REPOSITORY_LOCAL_PHONEBOOK: u32 = 1 << 0;
pub const REPOSITORY_SIM_CARD: u32 = 1 << 1;
pub const REPOSITORY_SPEED_DIAL: u32 = 1 << 2;
pub const REPOSITORY_FAVORITES: u32 = 1 << 3;

/// Features this client advertises during OBEX connect.
pub const LOCAL_SUPPORTED_FEATURES: u32 = FEATURE_DOWNLOADING | FEATURE_DEFAULT_IMAGE_FORMAT;

/// Features and repositories assumed for a remote whose record carries no
/// masks at all.
pub const DEFAULT_FEATURES: u32 = FEATURE_DOWNLOADING;
pub const DEFAULT_REPOSITORIES: u32 = REPOSITORY_LOCAL_PHONEBOOK;

const VALID_PSM: std::ops::RangeInclusive<u16> = 1..=30;

/// PBAP profile (GOEP) version of the remote record.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
pub enum ProfileVersion {
   #[serde(rename = "1.0")]
   #[strum(serialize = "1.0")]
   V1_0,
   #[serde(rename = "1.1")]
   #[strum(serialize = "1.1")]
   V1_1,
   #[serde(rename = "1.2")]
   #[strum(serialize = "1.2")]
   V1_2,
}

/// Snapshot of a remote device's advertised PBAP capabilities.
#[derive(Debug, Clone)]
pub struct PbapSdpRecord {
   device: Address,
   features: Option<u32>,
   repositories: Option<u32>,
   l2cap_psm: Option<u16>,
   rfcomm_channel: Option<u8>,
   profile_version: Option<ProfileVersion>,
}

impl PbapSdpRecord {
   pub fn new(
      device: Address,
      features: Option<u32>,
      repositories: Option<u32>,
      l2cap_psm: Option<u16>,
      rfcomm_channel: Option<u8>,
      profile_version: Option<ProfileVersion>,
   ) -> Self {
      Self {
         device,
         features,
         repositories,
         l2cap_psm,
         rfcomm_channel,
         profile_version,
      }
   }

   /// Builds a record for a device found to expose the PBAP PSE service
   /// without any further attribute data.
   pub fn with_defaults(device: Address) -> Self {
      Self::new(
         device,
         Some(DEFAULT_FEATURES),
         Some(DEFAULT_REPOSITORIES),
         None,
         None,
         Some(ProfileVersion::V1_1),
      )
   }

   /// Builds a record from per-device config overrides.
   pub fn from_overrides(device: Address, overrides: &KnownDevice) -> Self {
      Self::new(
         device,
         overrides.features.or(Some(DEFAULT_FEATURES)),
         overrides.repositories.or(Some(DEFAULT_REPOSITORIES)),
         overrides.l2cap_psm,
         overrides.rfcomm_channel,
         overrides.profile_version.or(Some(ProfileVersion::V1_1)),
      )
   }

   pub fn device(&self) -> Address {
      self.device
   }

   /// The advertised L2CAP PSM, or `None` when absent or outside the valid
   /// `[1, 30]` range. A PSM of 0 is the "invalid" sentinel and equivalent
   /// to absence.
   pub fn l2cap_psm(&self) -> Option<u16> {
      self.l2cap_psm.filter(|psm| VALID_PSM.contains(psm))
   }

   pub fn rfcomm_channel(&self) -> Option<u8> {
      self.rfcomm_channel
   }

   pub fn profile_version(&self) -> Option<ProfileVersion> {
      self.profile_version
   }

   pub fn supported_features(&self) -> Option<u32> {
      self.features
   }

   pub fn is_feature_supported(&self, feature: u32) -> bool {
      self.features.is_some_and(|mask| mask & feature != 0)
   }

   pub fn supports_downloading(&self) -> bool {
      self.is_feature_supported(FEATURE_DOWNLOADING)
   }

   pub fn supports_default_image_format(&self) -> bool {
      self.is_feature_supported(FEATURE_DEFAULT_IMAGE_FORMAT)
   }

   pub fn is_repository_supported(&self, repository: u32) -> bool {
      self.repositories.is_some_and(|mask| mask & repository != 0)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn record_with_psm(psm: Option<u16>) -> PbapSdpRecord {
      PbapSdpRecord::new(Address::any(), None, None, psm, None, None)
   }

   #[test]
   fn psm_validity() {
      assert_eq!(record_with_psm(None).l2cap_psm(), None);
      assert_eq!(record_with_psm(Some(0)).l2cap_psm(), None);
      assert_eq!(record_with_psm(Some(1)).l2cap_psm(), Some(1));
      assert_eq!(record_with_psm(Some(30)).l2cap_psm(), Some(30));
      assert_eq!(record_with_psm(Some(31)).l2cap_psm(), None);
      assert_eq!(record_with_psm(Some(0x1021)).l2cap_psm(), None);
   }

   #[test]
   fn absent_masks_support_nothing() {
      let record = record_with_psm(None);
      assert!(!record.supports_downloading());
      assert!(!record.supports_default_image_format());
      assert!(!record.is_repository_supported(REPOSITORY_LOCAL_PHONEBOOK));
   }

   #[test]
   fn feature_queries() {
      let record = PbapSdpRecord::new(
         Address::any(),
         Some(FEATURE_DOWNLOADING | FEATURE_DEFAULT_IMAGE_FORMAT),
         Some(REPOSITORY_LOCAL_PHONEBOOK | REPOSITORY_FAVORITES),
         None,
         None,
         Some(ProfileVersion::V1_2),
      );
      assert!(record.supports_downloading());
      assert!(record.supports_default_image_format());
      assert!(!record.is_feature_supported(FEATURE_BROWSING));
      assert!(record.is_repository_supported(REPOSITORY_FAVORITES));
      assert!(!record.is_repository_supported(REPOSITORY_SIM_CARD));
   }

   #[test]
   fn version_ordering_gates_features_parameter() {
      assert!(ProfileVersion::V1_2 >= ProfileVersion::V1_2);
      assert!(ProfileVersion::V1_1 < ProfileVersion::V1_2);
      assert_eq!(ProfileVersion::V1_2.to_string(), "1.2");
   }
}
