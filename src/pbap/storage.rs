//! Downloaded phonebook storage.
//!
//! Pulled contacts and call history are handed to a [`ContactsStorage`]
//! keyed by the remote device address. The in-memory implementation backs
//! the daemon's D-Bus queries; call history removal is a no-op when no
//! account exists for the device.

use std::collections::HashMap;

use bluer::Address;
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::pbap::vcard::{CallLogEntry, PhonebookEntry};

/// Sink for downloaded phonebook data, one account per remote device.
pub trait ContactsStorage: Send + Sync {
   /// Creates an account for a device. Idempotent.
   fn create_account(&self, device: Address);

   /// Drops a device's account and everything stored under it.
   fn remove_account(&self, device: Address);

   /// Stores contacts pulled from one phonebook path, replacing any
   /// earlier download of the same path.
   fn store_contacts(&self, device: Address, path: &str, contacts: Vec<PhonebookEntry>);

   /// Stores call history pulled from one call log path.
   fn store_call_log(&self, device: Address, path: &str, calls: Vec<CallLogEntry>);

   /// Removes stored call history for a path. Does nothing when the
   /// device has no account.
   fn remove_call_log(&self, device: Address, path: &str);
}

#[derive(Debug, Default)]
struct Account {
   contacts: HashMap<SmolStr, Vec<PhonebookEntry>>,
   call_logs: HashMap<SmolStr, Vec<CallLogEntry>>,
}

/// Process-local [`ContactsStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
   accounts: Mutex<HashMap<Address, Account>>,
}

impl MemoryStorage {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn has_account(&self, device: Address) -> bool {
      self.accounts.lock().contains_key(&device)
   }

   pub fn contacts(&self, device: Address, path: &str) -> Vec<PhonebookEntry> {
      self
         .accounts
         .lock()
         .get(&device)
         .and_then(|account| account.contacts.get(path))
         .cloned()
         .unwrap_or_default()
   }

   pub fn call_log(&self, device: Address, path: &str) -> Vec<CallLogEntry> {
      self
         .accounts
         .lock()
         .get(&device)
         .and_then(|account| account.call_logs.get(path))
         .cloned()
         .unwrap_or_default()
   }

   pub fn contact_count(&self, device: Address) -> usize {
      self
         .accounts
         .lock()
         .get(&device)
         .map(|account| account.contacts.values().map(Vec::len).sum())
         .unwrap_or(0)
   }
}

impl ContactsStorage for MemoryStorage {
   fn create_account(&self, device: Address) {
      self.accounts.lock().entry(device).or_default();
   }

   fn remove_account(&self, device: Address) {
      self.accounts.lock().remove(&device);
   }

   fn store_contacts(&self, device: Address, path: &str, contacts: Vec<PhonebookEntry>) {
      let mut accounts = self.accounts.lock();
      let account = accounts.entry(device).or_default();
      account.contacts.insert(SmolStr::new(path), contacts);
   }

   fn store_call_log(&self, device: Address, path: &str, calls: Vec<CallLogEntry>) {
      let mut accounts = self.accounts.lock();
      let account = accounts.entry(device).or_default();
      account.call_logs.insert(SmolStr::new(path), calls);
   }

   fn remove_call_log(&self, device: Address, path: &str) {
      let mut accounts = self.accounts.lock();
      if let Some(account) = accounts.get_mut(&device) {
         account.call_logs.remove(path);
      }
   }
}
