use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Bidirectional byte<->value codec. The default is [`JsonSerializer`]; swap
/// in another implementation (e.g. MessagePack) by implementing this trait,
/// the same seam the teacher's `Message::unmarshal_to` occupies but made
/// pluggable per spec.md §2 ("Serializer: bidirectional byte<->value codec").
#[async_trait]
pub trait Serializer: Send + Sync {
    fn encode<T: Serialize + Sync>(&self, value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

#[async_trait]
impl Serializer for JsonSerializer {
    fn encode<T: Serialize + Sync>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Error::from)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: i32,
        b: String,
    }

    #[test]
    fn json_round_trip() {
        let s = JsonSerializer;
        let value = Sample { a: 2, b: "x".into() };
        let bytes = s.encode(&value).unwrap();
        let decoded: Sample = s.decode(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn decode_failure_is_decode_error() {
        let s = JsonSerializer;
        let err = s.decode::<Sample>(b"not json").unwrap_err();
        assert_eq!(err.code(), "DECODE_ERROR");
    }
}
