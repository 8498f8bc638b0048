//! Phone Book Access Profile client internals.

pub mod handler;
pub mod obex;
pub mod sdp;
pub mod storage;
pub mod vcard;
