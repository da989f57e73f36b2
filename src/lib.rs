//! Type-tagged data model, wire codec, and packet framing for the LabRAD
//! protocol.
//!
//! - [`bytes`] — byte-level scalar primitives shared by the codec.
//! - [`types`] — the type tag language (`Type`, parsing, printing).
//! - [`time`] — the `LabradTime` instant used by `Type::Time`.
//! - [`data`] — `Data`: the in-memory value, its codec, and accessors.
//! - [`record`] — `Context` and `Record`.
//! - [`packet`] — packet framing over a byte stream.
//! - [`hydrant`] — random legal-value generation for round-trip testing.

pub mod bytes;
pub mod data;
pub mod hydrant;
pub mod packet;
pub mod record;
pub mod time;
pub mod types;

pub use self::data::{Data, DataError};
pub use self::packet::Packet;
pub use self::record::{Context, Record};
pub use self::time::LabradTime;
pub use self::types::{Type, TypeParseError};
