//! Phonebook wire format codec.
//!
//! Builds and parses the vCard / X-IRMC call-history text format that PBAP
//! pulls carry. Pure data transform, no I/O. Version 2.1 and 3.0 are
//! supported; 4.0 is rejected rather than silently degraded.

use std::str::FromStr;

use serde::Serialize;
use strum::{Display, EnumString};

use crate::error::{PbapError, Result};

/// Supported vCard format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcardVersion {
   V21,
   V30,
}

impl VcardVersion {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::V21 => "2.1",
         Self::V30 => "3.0",
      }
   }
}

impl FromStr for VcardVersion {
   type Err = PbapError;

   fn from_str(s: &str) -> Result<Self> {
      match s {
         "2.1" => Ok(Self::V21),
         "3.0" => Ok(Self::V30),
         other => Err(PbapError::UnsupportedFormatVersion(other.to_string())),
      }
   }
}

/// Direction tag of a call-history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
   #[strum(serialize = "MISSED")]
   Missed,
   #[strum(serialize = "RECEIVED")]
   Received,
   #[strum(serialize = "DIALED")]
   Dialed,
}

/// One parsed contact record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhonebookEntry {
   pub first: String,
   pub last: String,
   pub phone: Option<String>,
   pub address: Option<String>,
   pub email: Option<String>,
   pub starred: bool,
}

/// One parsed call-history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallLogEntry {
   pub call_type: CallType,
   /// `YYYYMMDDTHHMMSS`.
   pub timestamp: String,
   pub first: String,
   pub last: String,
   pub phone: Option<String>,
}

/// Builds a single vCard entry.
///
/// `BEGIN`, `VERSION`, `FN` and `N` are always emitted, in that order.
/// Optional fields are dropped from the output when absent, never emitted
/// empty. No newline follows `END:VCARD`.
pub fn encode_vcard(
   version: VcardVersion,
   first: &str,
   last: &str,
   phone: Option<&str>,
   addr: Option<&str>,
   email: Option<&str>,
) -> String {
   let mut out = String::new();
   out.push_str("BEGIN:VCARD\n");
   out.push_str("VERSION:");
   out.push_str(version.as_str());
   out.push('\n');

   out.push_str("FN:");
   out.push_str(first);
   out.push(' ');
   out.push_str(last);
   out.push('\n');

   // N is "LastName;FirstName;MiddleName;Prefix;Suffix".
   out.push_str("N:");
   out.push_str(last);
   out.push(';');
   out.push_str(first);
   out.push('\n');

   if let Some(phone) = phone {
      out.push_str("TEL;TYPE=CELL:");
      out.push_str(phone);
      out.push('\n');
   }
   if let Some(addr) = addr {
      out.push_str("ADR;TYPE=HOME:");
      out.push_str(addr);
      out.push('\n');
   }
   if let Some(email) = email {
      out.push_str("EMAIL;INTERNET:");
      out.push_str(email);
      out.push('\n');
   }

   out.push_str("END:VCARD");
   out
}

/// Builds a single call-history entry.
///
/// A call-history entry is a vCard carrying the call direction and the
/// time of the call in an `X-IRMC-CALL-DATETIME` field. The field syntax
/// depends on the version: `;TYPE=<type>` for 3.0, `;<type>` for 2.1.
/// `FN` is only present in 3.0 output.
pub fn encode_call_log_entry(
   version: VcardVersion,
   call_type: CallType,
   timestamp: &str,
   first: &str,
   last: &str,
   phone: &str,
) -> String {
   let mut out = String::new();
   out.push_str("BEGIN:VCARD\n");
   out.push_str("VERSION:");
   out.push_str(version.as_str());
   out.push('\n');

   if version == VcardVersion::V30 {
      out.push_str("FN:");
      out.push_str(first);
      out.push(' ');
      out.push_str(last);
      out.push('\n');
   }

   out.push_str("N:");
   out.push_str(last);
   out.push(';');
   out.push_str(first);
   out.push('\n');

   out.push_str("TEL;TYPE=0:");
   out.push_str(phone);
   out.push('\n');

   // Time format: YYYYMMDDTHHMMSS, e.g. 20050320T100000.
   out.push_str("X-IRMC-CALL-DATETIME;");
   if version == VcardVersion::V30 {
      out.push_str("TYPE=");
   }
   out.push_str(&call_type.to_string());
   out.push(':');
   out.push_str(timestamp);
   out.push('\n');

   out.push_str("END:VCARD");
   out
}

/// Joins entries into a full phonebook object: each entry terminated by a
/// newline, input order and duplicates preserved, no validation.
pub fn join_phonebook<I, S>(entries: I) -> String
where
   I: IntoIterator<Item = S>,
   S: AsRef<str>,
{
   let mut out = String::new();
   for entry in entries {
      out.push_str(entry.as_ref());
      out.push('\n');
   }
   out
}

/// Splits a pulled phonebook payload into contact entries. Unknown
/// properties are ignored; a card without an `N` line is dropped.
pub fn parse_phonebook(payload: &str) -> Vec<PhonebookEntry> {
   split_cards(payload)
      .into_iter()
      .filter_map(|card| {
         let (last, first) = card.name?;
         Some(PhonebookEntry {
            first,
            last,
            phone: card.phone,
            address: card.address,
            email: card.email,
            starred: false,
         })
      })
      .collect()
}

/// Splits a pulled call-history payload into call-log entries. Cards
/// without a recognizable `X-IRMC-CALL-DATETIME` field are dropped.
pub fn parse_call_log(payload: &str) -> Vec<CallLogEntry> {
   split_cards(payload)
      .into_iter()
      .filter_map(|card| {
         let (last, first) = card.name?;
         let (call_type, timestamp) = card.call?;
         Some(CallLogEntry {
            call_type,
            timestamp,
            first,
            last,
            phone: card.phone,
         })
      })
      .collect()
}

#[derive(Default)]
struct RawCard {
   name: Option<(String, String)>, // (last, first)
   phone: Option<String>,
   address: Option<String>,
   email: Option<String>,
   call: Option<(CallType, String)>,
}

fn split_cards(payload: &str) -> Vec<RawCard> {
   let mut cards = Vec::new();
   let mut current: Option<RawCard> = None;

   for line in payload.lines() {
      let line = line.trim_end_matches('\r');
      let Some((prop, value)) = line.split_once(':') else {
         continue;
      };

      let mut params = prop.split(';');
      let name = params.next().unwrap_or_default().to_ascii_uppercase();

      match name.as_str() {
         "BEGIN" if value.eq_ignore_ascii_case("VCARD") => {
            current = Some(RawCard::default());
         },
         "END" if value.eq_ignore_ascii_case("VCARD") => {
            if let Some(card) = current.take() {
               cards.push(card);
            }
         },
         _ => {
            let Some(card) = current.as_mut() else {
               continue;
            };
            match name.as_str() {
               "N" => {
                  let mut parts = value.split(';');
                  let last = parts.next().unwrap_or_default().to_string();
                  let first = parts.next().unwrap_or_default().to_string();
                  card.name = Some((last, first));
               },
               "TEL" => {
                  card.phone.get_or_insert_with(|| value.to_string());
               },
               "ADR" => {
                  card.address.get_or_insert_with(|| value.to_string());
               },
               "EMAIL" => {
                  card.email.get_or_insert_with(|| value.to_string());
               },
               "X-IRMC-CALL-DATETIME" => {
                  // 3.0 carries the direction as TYPE=<T>, 2.1 as a bare
                  // parameter token.
                  let call_type = params.find_map(|p| {
                     let p = p.strip_prefix("TYPE=").unwrap_or(p);
                     CallType::from_str(p).ok()
                  });
                  if let Some(call_type) = call_type {
                     card.call = Some((call_type, value.to_string()));
                  }
               },
               _ => {},
            }
         },
      }
   }

   cards
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn version_parsing_rejects_4_0() {
      assert_eq!("2.1".parse::<VcardVersion>().unwrap(), VcardVersion::V21);
      assert_eq!("3.0".parse::<VcardVersion>().unwrap(), VcardVersion::V30);
      assert!(matches!(
         "4.0".parse::<VcardVersion>(),
         Err(PbapError::UnsupportedFormatVersion(v)) if v == "4.0"
      ));
      assert!("".parse::<VcardVersion>().is_err());
      assert!("2.2".parse::<VcardVersion>().is_err());
   }

   #[test]
   fn vcard_21_with_phone_only() {
      let vcard = encode_vcard(
         VcardVersion::V21,
         "John",
         "Doe",
         Some("555-1234"),
         None,
         None,
      );
      assert_eq!(
         vcard,
         "BEGIN:VCARD\nVERSION:2.1\nFN:John Doe\nN:Doe;John\n\
          TEL;TYPE=CELL:555-1234\nEND:VCARD"
      );
   }

   #[test]
   fn vcard_30_with_all_fields() {
      let vcard = encode_vcard(
         VcardVersion::V30,
         "John",
         "Doe",
         Some("555-1234"),
         Some("123 Fake Street"),
         Some("john@doe.org"),
      );
      assert_eq!(
         vcard,
         "BEGIN:VCARD\nVERSION:3.0\nFN:John Doe\nN:Doe;John\n\
          TEL;TYPE=CELL:555-1234\nADR;TYPE=HOME:123 Fake Street\n\
          EMAIL;INTERNET:john@doe.org\nEND:VCARD"
      );
   }

   #[test]
   fn call_log_entry_30_carries_fn_and_typed_datetime() {
      let entry = encode_call_log_entry(
         VcardVersion::V30,
         CallType::Missed,
         "20050320T100000",
         "John",
         "Doe",
         "555-1234",
      );
      assert!(entry.contains("FN:John Doe\n"));
      assert!(entry.contains("X-IRMC-CALL-DATETIME;TYPE=MISSED:20050320T100000\n"));
      assert!(entry.ends_with("END:VCARD"));
   }

   #[test]
   fn call_log_entry_21_omits_fn_and_uses_bare_type() {
      let entry = encode_call_log_entry(
         VcardVersion::V21,
         CallType::Dialed,
         "20050320T100000",
         "John",
         "Doe",
         "555-1234",
      );
      assert!(!entry.contains("FN:"));
      assert!(entry.contains("X-IRMC-CALL-DATETIME;DIALED:20050320T100000\n"));
   }

   #[test]
   fn join_preserves_order_and_duplicates() {
      let a = encode_vcard(VcardVersion::V21, "A", "A", None, None, None);
      let b = encode_vcard(VcardVersion::V21, "B", "B", None, None, None);

      let book = join_phonebook([&a, &b, &a]);
      assert_eq!(book, format!("{a}\n{b}\n{a}\n"));
      assert_eq!(join_phonebook(Vec::<String>::new()), "");
   }

   #[test]
   fn parse_roundtrips_contacts() {
      let book = join_phonebook([
         encode_vcard(
            VcardVersion::V30,
            "John",
            "Doe",
            Some("555-1234"),
            Some("123 Fake Street"),
            None,
         ),
         encode_vcard(VcardVersion::V21, "Jane", "Roe", None, None, None),
      ]);

      let entries = parse_phonebook(&book);
      assert_eq!(entries.len(), 2);
      assert_eq!(entries[0].first, "John");
      assert_eq!(entries[0].last, "Doe");
      assert_eq!(entries[0].phone.as_deref(), Some("555-1234"));
      assert_eq!(entries[0].address.as_deref(), Some("123 Fake Street"));
      assert_eq!(entries[0].email, None);
      assert_eq!(entries[1].first, "Jane");
      assert_eq!(entries[1].phone, None);
   }

   #[test]
   fn parse_roundtrips_call_logs_both_versions() {
      let book = join_phonebook([
         encode_call_log_entry(
            VcardVersion::V30,
            CallType::Missed,
            "20050320T100000",
            "John",
            "Doe",
            "555-1234",
         ),
         encode_call_log_entry(
            VcardVersion::V21,
            CallType::Received,
            "20230101T000000",
            "Jane",
            "Roe",
            "555-0000",
         ),
      ]);

      let entries = parse_call_log(&book);
      assert_eq!(entries.len(), 2);
      assert_eq!(entries[0].call_type, CallType::Missed);
      assert_eq!(entries[0].timestamp, "20050320T100000");
      assert_eq!(entries[1].call_type, CallType::Received);
      assert_eq!(entries[1].last, "Roe");
   }

   #[test]
   fn parse_skips_malformed_cards() {
      let payload = "BEGIN:VCARD\nVERSION:2.1\nFN:No Name Line\nEND:VCARD\n\
                     garbage outside any card\n\
                     BEGIN:VCARD\nVERSION:2.1\nN:Doe;John\nEND:VCARD\n";
      let entries = parse_phonebook(payload);
      assert_eq!(entries.len(), 1);
      assert_eq!(entries[0].last, "Doe");

      // Contact cards are not call logs.
      assert!(parse_call_log(payload).is_empty());
   }
}
