//! Application-side value transcoders.
//!
//! A [`Transcoder`] turns a value into a [`CachedObject`] (opaque flags plus
//! bytes) and back. One transcoder instance is usually built at startup and
//! shared across many calls and keys through an `Arc`.

use crate::error::TranscoderError;
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;

/// Flags written by [`BytesTranscoder`].
pub const BYTES_FLAG: u32 = 0;

/// Flags written by [`StringTranscoder`].
pub const STRING_FLAG: u32 = 0x20;

/// Flags written by [`JsonTranscoder`].
pub const JSON_FLAG: u32 = 0x40;

/// Flags plus raw payload exchanged between transcoders and the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachedObject {
    flags: u32,
    data: Vec<u8>,
}

impl CachedObject {
    /// Create a cached object.
    pub fn new(flags: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            flags,
            data: data.into(),
        }
    }

    /// Opaque flags stored next to the payload.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Raw payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume into flags and payload.
    pub fn into_parts(self) -> (u32, Vec<u8>) {
        (self.flags, self.data)
    }
}

/// Value codec supplied by the application.
pub trait Transcoder<T>: Send + Sync {
    /// Encode a value.
    fn encode(&self, value: &T) -> Result<CachedObject, TranscoderError>;

    /// Decode a previously encoded value.
    fn decode(&self, data: &CachedObject) -> Result<T, TranscoderError>;
}

/// Stores values as JSON documents.
pub struct JsonTranscoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonTranscoder<T> {
    /// Create a JSON transcoder.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonTranscoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Transcoder<T> for JsonTranscoder<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<CachedObject, TranscoderError> {
        let data = serde_json::to_vec(value).map_err(|e| TranscoderError::Encode(e.to_string()))?;
        Ok(CachedObject::new(JSON_FLAG, data))
    }

    fn decode(&self, data: &CachedObject) -> Result<T, TranscoderError> {
        serde_json::from_slice(data.data()).map_err(|e| TranscoderError::Decode(e.to_string()))
    }
}

/// Stores UTF-8 strings verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringTranscoder;

impl Transcoder<String> for StringTranscoder {
    fn encode(&self, value: &String) -> Result<CachedObject, TranscoderError> {
        Ok(CachedObject::new(STRING_FLAG, value.as_bytes()))
    }

    fn decode(&self, data: &CachedObject) -> Result<String, TranscoderError> {
        String::from_utf8(data.data().to_vec()).map_err(|e| TranscoderError::Decode(e.to_string()))
    }
}

/// Stores byte vectors verbatim, ignoring flags on decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesTranscoder;

impl Transcoder<Vec<u8>> for BytesTranscoder {
    fn encode(&self, value: &Vec<u8>) -> Result<CachedObject, TranscoderError> {
        Ok(CachedObject::new(BYTES_FLAG, value.clone()))
    }

    fn decode(&self, data: &CachedObject) -> Result<Vec<u8>, TranscoderError> {
        Ok(data.data().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        name: String,
    }

    #[test]
    fn test_json_transcoder() {
        let transcoder = JsonTranscoder::<Profile>::new();
        let profile = Profile {
            id: 7,
            name: "Alice".into(),
        };

        let encoded = transcoder.encode(&profile).unwrap();
        assert_eq!(encoded.flags(), JSON_FLAG);
        assert_eq!(transcoder.decode(&encoded).unwrap(), profile);
    }

    #[test]
    fn test_json_transcoder_rejects_garbage() {
        let transcoder = JsonTranscoder::<Profile>::new();
        let err = transcoder
            .decode(&CachedObject::new(JSON_FLAG, b"{not json".to_vec()))
            .unwrap_err();
        assert!(matches!(err, TranscoderError::Decode(_)));
    }

    #[test]
    fn test_string_transcoder_rejects_invalid_utf8() {
        let err = StringTranscoder
            .decode(&CachedObject::new(STRING_FLAG, vec![0xff, 0xfe]))
            .unwrap_err();
        assert!(matches!(err, TranscoderError::Decode(_)));
    }

    #[test]
    fn test_cached_object_parts() {
        let object = CachedObject::new(3, b"abc".to_vec());
        assert_eq!(object.flags(), 3);
        assert_eq!(object.data(), b"abc");
        assert_eq!(object.into_parts(), (3, b"abc".to_vec()));
    }
}
