//! Event handling for PBAP client status updates.
//!
//! This module provides the event infrastructure for notifying about
//! per-device profile changes such as connection state transitions and
//! completed phonebook pulls.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::bluetooth::manager::ConnectionState;

/// Events that can be emitted by the PBAP client service.
#[derive(Debug, Clone)]
pub enum PbapEvent {
   ConnectionStateChanged(ConnectionState),
   PhonebookSynced { path: SmolStr, count: usize },
   CallLogSynced { path: SmolStr, count: usize },
   DeviceError,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: Address, event: PbapEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
