//! Error types for the PBAP client service.
//!
//! This module defines all error types that can occur while talking to a
//! remote phonebook server, including transport, OBEX, D-Bus and data
//! format errors.

use bluer::Address;
use thiserror::Error;

/// Main error type for the PBAP client service.
#[derive(Error, Debug)]
pub enum PbapError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid transport parameter: {0}")]
   InvalidTransportParameter(String),

   #[error("No usable transport to the remote device")]
   TransportUnavailable,

   #[error("Operation on a closed socket")]
   SocketClosed,

   #[error("OBEX session start attempted without a live socket")]
   ObexPreconditionFailed,

   #[error("OBEX request rejected with response code {0:#04x}")]
   ObexRejected(u8),

   #[error("Invalid packet: {0}")]
   InvalidPacket(String),

   #[error("Unsupported vCard version: {0}")]
   UnsupportedFormatVersion(String),

   #[error("Missing required handler configuration: {0}")]
   InvalidConfiguration(&'static str),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Connection policy forbids connecting to device")]
   PolicyForbidden,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with [`PbapError`].
pub type Result<T> = std::result::Result<T, PbapError>;
