//! MsgPack codec using `rmp-serde`.
//!
//! Always encodes with `to_vec_named`, so structs travel as maps keyed by
//! field name. Workers written in other languages decode those without
//! knowing the Rust field order.
//!
//! # Example
//!
//! ```
//! use gearman_async::codec::{Codec, MsgPackCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Thumbnail {
//!     id: u32,
//!     path: String,
//! }
//!
//! let msg = Thumbnail { id: 42, path: "a.png".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Thumbnail = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::error::Result;

/// MessagePack codec for structured workloads.
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    #[inline]
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        // to_vec would write structs as positional arrays
        Ok(rmp_serde::to_vec_named(value)?)
    }

    #[inline]
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GearmanError;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Thumbnail {
        path: String,
        width: u32,
        crop: bool,
    }

    fn thumbnail() -> Thumbnail {
        Thumbnail {
            path: "a.png".to_string(),
            width: 128,
            crop: false,
        }
    }

    #[test]
    fn test_workload_round_trip() {
        let encoded = MsgPackCodec::encode(&thumbnail()).unwrap();
        let decoded: Thumbnail = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, thumbnail());
    }

    #[test]
    fn test_structs_encode_as_maps() {
        let encoded = MsgPackCodec::encode(&thumbnail()).unwrap();

        // fixmap with 3 entries, a positional array would be 0x93
        assert_eq!(encoded[0], 0x83, "Expected fixmap, got {:02X}", encoded[0]);

        let fields: BTreeMap<String, serde_json::Value> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(
            fields.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["crop", "path", "width"]
        );
    }

    #[test]
    fn test_unit_result_is_nil() {
        let encoded = MsgPackCodec::encode(&Option::<u32>::None).unwrap();
        assert_eq!(encoded, vec![0xc0]);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let result: Result<Thumbnail> = MsgPackCodec::decode(b"\xc1\xc1");
        assert!(matches!(result, Err(GearmanError::MsgPackDecode(_))));
    }
}
