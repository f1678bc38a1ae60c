//! Codec module - serialization of typed workloads and results.
//!
//! Gearman payloads are opaque bytes. These codecs turn serde types into
//! payload bytes and back:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`, structs as maps)
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! # Design
//!
//! Codecs are marker structs implementing [`Codec`] with static methods, so
//! the codec is picked at compile time as a type parameter.
//!
//! # Example
//!
//! ```
//! use gearman_async::codec::{Codec, JsonCodec, MsgPackCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let encoded = JsonCodec::encode(&vec![1, 2, 3]).unwrap();
//! assert_eq!(encoded, b"[1,2,3]");
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Payload serialization format.
pub trait Codec {
    /// Encode a value to payload bytes.
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>>;

    /// Decode payload bytes to a value.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}
