//! Wire protocol for the document channel.
//!
//! Every frame is a JSON text frame naming an event and carrying an optional
//! payload: `{"event":"send-changes","payload":{"ops":[...]}}`.
//! - [`envelope`]: the typed client and server events
//! - [`encoding`]: frame encoding, decoding and size limits

pub mod encoding;
pub mod envelope;

pub use encoding::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{ClientEvent, Membership, ServerEvent, TitleUpdate};
