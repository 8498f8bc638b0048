//! Bluetooth transport and profile management.

pub mod manager;
pub mod socket;
