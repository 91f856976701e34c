//! Codec types of the underlying client.

use crate::error::TranscoderError;

/// Flags for [`CacheValue::Text`]. Counters created by `incr`/`decr` read back as text.
pub const FLAG_TEXT: u32 = 0;
/// Flags for [`CacheValue::Json`].
pub const FLAG_JSON: u32 = 1;
/// Flags for [`CacheValue::Integer`].
pub const FLAG_INTEGER: u32 = 2;
/// Flags for [`CacheValue::Boolean`].
pub const FLAG_BOOLEAN: u32 = 3;
/// Flags for [`CacheValue::Bytes`].
pub const FLAG_BYTES: u32 = 4;

/// Flags plus payload as stored by the underlying client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachedData {
    /// Opaque flags stored next to the payload
    pub flag: u32,
    /// Raw payload
    pub data: Vec<u8>,
}

impl CachedData {
    /// Create cached data.
    pub fn new(flag: u32, data: Vec<u8>) -> Self {
        Self { flag, data }
    }
}

/// Codec capability of the underlying client.
pub trait BackendTranscoder<T>: Send + Sync {
    /// Encode a value into cached data.
    fn encode(&self, value: &T) -> Result<CachedData, TranscoderError>;

    /// Decode cached data into a value.
    fn decode(&self, data: &CachedData) -> Result<T, TranscoderError>;
}

/// Values the underlying client stores without an application transcoder.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// UTF-8 text
    Text(String),
    /// Signed integer
    Integer(i64),
    /// Boolean
    Boolean(bool),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Arbitrary JSON document
    Json(serde_json::Value),
}

impl CacheValue {
    /// Text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content. Text holding decimal digits (as written by counters) also qualifies.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for CacheValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Default transcoder of the bundled backends.
///
/// Numbers and booleans are stored as ASCII so server-side `incr`/`decr`
/// keep working on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializingTranscoder;

impl BackendTranscoder<CacheValue> for SerializingTranscoder {
    fn encode(&self, value: &CacheValue) -> Result<CachedData, TranscoderError> {
        let data = match value {
            CacheValue::Text(s) => CachedData::new(FLAG_TEXT, s.as_bytes().to_vec()),
            CacheValue::Integer(i) => CachedData::new(FLAG_INTEGER, i.to_string().into_bytes()),
            CacheValue::Boolean(b) => {
                CachedData::new(FLAG_BOOLEAN, if *b { b"1".to_vec() } else { b"0".to_vec() })
            }
            CacheValue::Bytes(b) => CachedData::new(FLAG_BYTES, b.clone()),
            CacheValue::Json(v) => CachedData::new(
                FLAG_JSON,
                serde_json::to_vec(v).map_err(|e| TranscoderError::Encode(e.to_string()))?,
            ),
        };
        Ok(data)
    }

    fn decode(&self, data: &CachedData) -> Result<CacheValue, TranscoderError> {
        let text = || {
            std::str::from_utf8(&data.data).map_err(|e| TranscoderError::Decode(e.to_string()))
        };

        match data.flag {
            FLAG_TEXT => Ok(match String::from_utf8(data.data.clone()) {
                Ok(s) => CacheValue::Text(s),
                Err(e) => CacheValue::Bytes(e.into_bytes()),
            }),
            FLAG_INTEGER => text()?
                .trim()
                .parse()
                .map(CacheValue::Integer)
                .map_err(|e| TranscoderError::Decode(format!("invalid integer: {}", e))),
            FLAG_BOOLEAN => match data.data.as_slice() {
                b"1" => Ok(CacheValue::Boolean(true)),
                b"0" => Ok(CacheValue::Boolean(false)),
                _ => Err(TranscoderError::Decode("invalid boolean".to_string())),
            },
            FLAG_JSON => serde_json::from_slice(&data.data)
                .map(CacheValue::Json)
                .map_err(|e| TranscoderError::Decode(e.to_string())),
            _ => Ok(CacheValue::Bytes(data.data.clone())),
        }
    }
}
