//! Minimal OBEX client for PBAP pulls.
//!
//! Implements the subset of GOEP a phonebook client needs: CONNECT with
//! the PBAP target UUID, chunked GET of phonebook objects, DISCONNECT.
//! The session owns the socket for its whole life; all framing follows
//! OBEX 1.0.

use log::{debug, warn};
use smallvec::SmallVec;

use crate::{
   bluetooth::socket::{PBAP_PACKET_SIZE, PbapSocket},
   error::{PbapError, Result},
};

const OPCODE_CONNECT: u8 = 0x80;
const OPCODE_DISCONNECT: u8 = 0x81;
const OPCODE_GET_FINAL: u8 = 0x83;

const RESPONSE_CONTINUE: u8 = 0x90;
const RESPONSE_SUCCESS: u8 = 0xA0;

const OBEX_VERSION_1_0: u8 = 0x10;

const HEADER_NAME: u8 = 0x01;
const HEADER_TYPE: u8 = 0x42;
const HEADER_TARGET: u8 = 0x46;
const HEADER_BODY: u8 = 0x48;
const HEADER_END_OF_BODY: u8 = 0x49;
const HEADER_APP_PARAMETERS: u8 = 0x4C;
const HEADER_CONNECTION_ID: u8 = 0xCB;

/// PBAP target UUID carried in the CONNECT request, PBAP v1.2.3 Sec. 6.4.
const PBAP_TARGET: [u8; 16] = [
   0x79, 0x61, 0x35, 0xf0, 0xf0, 0xc5, 0x11, 0xd8, 0x09, 0x66, 0x08, 0x00, 0x20, 0x0c, 0x9a, 0x66,
];

/// MIME type of every phonebook object, null-terminated as OBEX type
/// headers are.
const TYPE_PHONEBOOK: &[u8] = b"x-bt/phonebook\0";

// Application parameter tags, PBAP v1.2.3 Sec. 6.2.1.
const OAP_ORDER: u8 = 0x01;
const OAP_MAX_LIST_COUNT: u8 = 0x04;
const OAP_LIST_START_OFFSET: u8 = 0x05;
const OAP_PROPERTY_SELECTOR: u8 = 0x06;
const OAP_FORMAT: u8 = 0x07;
const OAP_PHONEBOOK_SIZE: u8 = 0x08;
const OAP_NEW_MISSED_CALLS: u8 = 0x09;
const OAP_PBAP_SUPPORTED_FEATURES: u8 = 0x10;

/// vCard 3.0 value for the `format` application parameter; 2.1 is the
/// zero default.
pub const FORMAT_VCARD_30: u8 = 1;

type Packet = SmallVec<[u8; 64]>;

/// Application parameters attached to a pull request.
#[derive(Debug, Default, Clone)]
pub struct AppParams {
   pub order: Option<u8>,
   pub max_list_count: Option<u16>,
   pub list_start_offset: Option<u16>,
   pub property_selector: Option<u64>,
   pub format: Option<u8>,
   pub supported_features: Option<u32>,
}

impl AppParams {
   /// Parameters that ask for the phonebook size instead of its contents.
   pub fn size_only() -> Self {
      Self {
         max_list_count: Some(0),
         ..Default::default()
      }
   }

   fn is_empty(&self) -> bool {
      self.encode().is_empty()
   }

   fn encode(&self) -> Vec<u8> {
      let mut out = Vec::new();
      if let Some(v) = self.order {
         push_tlv(&mut out, OAP_ORDER, &[v]);
      }
      if let Some(v) = self.max_list_count {
         push_tlv(&mut out, OAP_MAX_LIST_COUNT, &v.to_be_bytes());
      }
      if let Some(v) = self.list_start_offset {
         push_tlv(&mut out, OAP_LIST_START_OFFSET, &v.to_be_bytes());
      }
      if let Some(v) = self.property_selector {
         push_tlv(&mut out, OAP_PROPERTY_SELECTOR, &v.to_be_bytes());
      }
      if let Some(v) = self.format {
         push_tlv(&mut out, OAP_FORMAT, &[v]);
      }
      if let Some(v) = self.supported_features {
         push_tlv(&mut out, OAP_PBAP_SUPPORTED_FEATURES, &v.to_be_bytes());
      }
      out
   }
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
   out.push(tag);
   out.push(value.len() as u8);
   out.extend_from_slice(value);
}

/// Result of one pull operation.
#[derive(Debug, Default)]
pub struct PullResult {
   pub body: Vec<u8>,
   pub phonebook_size: Option<u16>,
   pub new_missed_calls: Option<u8>,
}

impl PullResult {
   fn absorb_app_params(&mut self, data: &[u8]) {
      let mut rest = data;
      while let [tag, len, tail @ ..] = rest {
         let len = *len as usize;
         if tail.len() < len {
            break;
         }
         let (value, next) = tail.split_at(len);
         match *tag {
            OAP_PHONEBOOK_SIZE if len == 2 => {
               self.phonebook_size = Some(u16::from_be_bytes([value[0], value[1]]));
            },
            OAP_NEW_MISSED_CALLS if len == 1 => {
               self.new_missed_calls = Some(value[0]);
            },
            _ => {},
         }
         rest = next;
      }
   }
}

/// An OBEX client session over one [`PbapSocket`].
pub struct ObexSession {
   socket: PbapSocket,
   connection_id: Option<u32>,
   peer_max_packet: u16,
   connected: bool,
   supported_features: Option<u32>,
}

impl ObexSession {
   /// Wraps a connected socket. `supported_features` is advertised in the
   /// CONNECT request when the remote profile version calls for it.
   pub fn new(socket: PbapSocket, supported_features: Option<u32>) -> Self {
      Self {
         socket,
         connection_id: None,
         peer_max_packet: PBAP_PACKET_SIZE,
         connected: false,
         supported_features,
      }
   }

   pub fn socket(&self) -> &PbapSocket {
      &self.socket
   }

   pub fn is_connected(&self) -> bool {
      self.connected
   }

   /// Issues the OBEX CONNECT request and records the connection id the
   /// server hands back.
   pub async fn connect(&mut self) -> Result<()> {
      let mut pkt = vec![
         OPCODE_CONNECT,
         0,
         0,
         OBEX_VERSION_1_0,
         0, // flags
      ];
      pkt.extend_from_slice(&self.socket.max_receive_size().to_be_bytes());
      push_bytes_header(&mut pkt, HEADER_TARGET, &PBAP_TARGET);

      if let Some(features) = self.supported_features {
         let params = AppParams {
            supported_features: Some(features),
            ..Default::default()
         };
         push_bytes_header(&mut pkt, HEADER_APP_PARAMETERS, &params.encode());
      }

      self.send_packet(&pkt).await?;

      let (code, body) = self.read_packet().await?;
      if code != RESPONSE_SUCCESS {
         return Err(PbapError::ObexRejected(code));
      }
      // Connect responses carry version, flags and peer MTU before the
      // headers.
      if body.len() < 4 {
         return Err(PbapError::InvalidPacket("short connect response".into()));
      }
      self.peer_max_packet = u16::from_be_bytes([body[2], body[3]]).max(PBAP_PACKET_SIZE);

      for (id, value) in parse_headers(&body[4..])? {
         if id == HEADER_CONNECTION_ID && value.len() == 4 {
            self.connection_id = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
         }
      }

      self.connected = true;
      debug!(
         "OBEX session up with {} (connection id {:?})",
         self.socket.remote_device(),
         self.connection_id
      );
      Ok(())
   }

   /// Pulls one phonebook object, draining Continue responses until the
   /// server reports success.
   pub async fn pull(&mut self, path: &str, params: &AppParams) -> Result<PullResult> {
      if !self.connected {
         return Err(PbapError::ObexPreconditionFailed);
      }

      let mut pkt = vec![OPCODE_GET_FINAL, 0, 0];
      if let Some(id) = self.connection_id {
         push_u32_header(&mut pkt, HEADER_CONNECTION_ID, id);
      }
      push_unicode_header(&mut pkt, HEADER_NAME, path);
      push_bytes_header(&mut pkt, HEADER_TYPE, TYPE_PHONEBOOK);
      if !params.is_empty() {
         push_bytes_header(&mut pkt, HEADER_APP_PARAMETERS, &params.encode());
      }
      self.send_packet(&pkt).await?;

      let mut result = PullResult::default();
      loop {
         let (code, body) = self.read_packet().await?;
         for (id, value) in parse_headers(&body)? {
            match id {
               HEADER_BODY | HEADER_END_OF_BODY => result.body.extend_from_slice(&value),
               HEADER_APP_PARAMETERS => result.absorb_app_params(&value),
               _ => {},
            }
         }

         match code {
            RESPONSE_SUCCESS => return Ok(result),
            RESPONSE_CONTINUE => {
               let mut pkt = vec![OPCODE_GET_FINAL, 0, 0];
               if let Some(id) = self.connection_id {
                  push_u32_header(&mut pkt, HEADER_CONNECTION_ID, id);
               }
               self.send_packet(&pkt).await?;
            },
            other => return Err(PbapError::ObexRejected(other)),
         }
      }
   }

   /// Ends the OBEX session. The socket stays open; callers close it
   /// separately.
   pub async fn disconnect(&mut self) -> Result<()> {
      if !self.connected {
         return Ok(());
      }
      self.connected = false;

      let mut pkt = vec![OPCODE_DISCONNECT, 0, 0];
      if let Some(id) = self.connection_id {
         push_u32_header(&mut pkt, HEADER_CONNECTION_ID, id);
      }
      self.send_packet(&pkt).await?;

      let (code, _body) = self.read_packet().await?;
      if code != RESPONSE_SUCCESS {
         return Err(PbapError::ObexRejected(code));
      }
      Ok(())
   }

   /// Graceful teardown: best-effort DISCONNECT, then socket close.
   pub async fn close(mut self) {
      if let Err(e) = self.disconnect().await {
         warn!(
            "OBEX disconnect from {} failed: {e}",
            self.socket.remote_device()
         );
      }
      self.socket.close().await;
   }

   /// Forced teardown without touching the transport.
   pub fn abort(mut self) {
      self.connected = false;
      self.socket.abort();
   }

   async fn send_packet(&mut self, pkt: &[u8]) -> Result<()> {
      let mut pkt = Packet::from_slice(pkt);
      let len = pkt.len() as u16;
      pkt[1..3].copy_from_slice(&len.to_be_bytes());
      debug!(
         "→ {}: {}",
         self.socket.remote_device(),
         hex::encode(pkt.as_slice())
      );
      self.socket.write_all(&pkt).await
   }

   /// Reads one OBEX packet, returning the response code and everything
   /// after the length field.
   async fn read_packet(&mut self) -> Result<(u8, Vec<u8>)> {
      let mut head = [0u8; 3];
      self.socket.read_exact(&mut head).await?;
      let len = u16::from_be_bytes([head[1], head[2]]) as usize;
      if len < 3 {
         return Err(PbapError::InvalidPacket(format!(
            "OBEX packet length {len} too short"
         )));
      }

      let mut body = vec![0u8; len - 3];
      self.socket.read_exact(&mut body).await?;
      debug!(
         "← {}: {}{}",
         self.socket.remote_device(),
         hex::encode(head),
         hex::encode(&body)
      );
      Ok((head[0], body))
   }
}

fn push_bytes_header(pkt: &mut Vec<u8>, id: u8, data: &[u8]) {
   pkt.push(id);
   pkt.extend_from_slice(&((data.len() as u16 + 3).to_be_bytes()));
   pkt.extend_from_slice(data);
}

fn push_unicode_header(pkt: &mut Vec<u8>, id: u8, text: &str) {
   let mut data: Vec<u8> = text.encode_utf16().flat_map(u16::to_be_bytes).collect();
   data.extend_from_slice(&[0, 0]);
   pkt.push(id);
   pkt.extend_from_slice(&((data.len() as u16 + 3).to_be_bytes()));
   pkt.extend_from_slice(&data);
}

fn push_u32_header(pkt: &mut Vec<u8>, id: u8, value: u32) {
   pkt.push(id);
   pkt.extend_from_slice(&value.to_be_bytes());
}

/// Walks a header list. The top two bits of each header id encode its
/// layout: unicode and byte-sequence headers carry a 2-byte length, the
/// rest are fixed 1 or 4 byte values.
fn parse_headers(data: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
   let mut headers = Vec::new();
   let mut i = 0;

   while i < data.len() {
      let id = data[i];
      match id & 0xC0 {
         0x00 | 0x40 => {
            if i + 3 > data.len() {
               return Err(PbapError::InvalidPacket("truncated header".into()));
            }
            let len = u16::from_be_bytes([data[i + 1], data[i + 2]]) as usize;
            if len < 3 || i + len > data.len() {
               return Err(PbapError::InvalidPacket("bad header length".into()));
            }
            headers.push((id, data[i + 3..i + len].to_vec()));
            i += len;
         },
         0x80 => {
            if i + 2 > data.len() {
               return Err(PbapError::InvalidPacket("truncated header".into()));
            }
            headers.push((id, vec![data[i + 1]]));
            i += 2;
         },
         _ => {
            if i + 5 > data.len() {
               return Err(PbapError::InvalidPacket("truncated header".into()));
            }
            headers.push((id, data[i + 1..i + 5].to_vec()));
            i += 5;
         },
      }
   }

   Ok(headers)
}
