//! Bridges between application transcoders and the underlying client's codec.

use crate::backend::{BackendTranscoder, CacheValue, CachedData};
use crate::error::TranscoderError;
use crate::transcoder::{CachedObject, Transcoder};
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

/// Shared handle to an application transcoder.
///
/// The adapter cache keys on the identity of the `Arc` allocation, so reuse
/// the same handle across calls.
pub type SharedTranscoder<T> = Arc<dyn Transcoder<T>>;

/// Presents one application [`Transcoder`] as a [`BackendTranscoder`].
pub struct TranscoderAdapter<T> {
    transcoder: SharedTranscoder<T>,
}

impl<T> TranscoderAdapter<T> {
    /// Wrap an application transcoder.
    pub fn new(transcoder: SharedTranscoder<T>) -> Self {
        Self { transcoder }
    }

    /// The wrapped transcoder.
    pub fn transcoder(&self) -> &SharedTranscoder<T> {
        &self.transcoder
    }
}

impl<T> BackendTranscoder<T> for TranscoderAdapter<T> {
    fn encode(&self, value: &T) -> Result<CachedData, TranscoderError> {
        let (flag, data) = self.transcoder.encode(value)?.into_parts();
        Ok(CachedData::new(flag, data))
    }

    fn decode(&self, data: &CachedData) -> Result<T, TranscoderError> {
        self.transcoder
            .decode(&CachedObject::new(data.flag, data.data.clone()))
    }
}

/// Presents the underlying client's default codec as an application [`Transcoder`].
pub struct TranscoderWrapper {
    transcoder: Arc<dyn BackendTranscoder<CacheValue>>,
}

impl TranscoderWrapper {
    /// Wrap a backend transcoder.
    pub fn new(transcoder: Arc<dyn BackendTranscoder<CacheValue>>) -> Self {
        Self { transcoder }
    }
}

impl Transcoder<CacheValue> for TranscoderWrapper {
    fn encode(&self, value: &CacheValue) -> Result<CachedObject, TranscoderError> {
        let data = self.transcoder.encode(value)?;
        Ok(CachedObject::new(data.flag, data.data))
    }

    fn decode(&self, data: &CachedObject) -> Result<CacheValue, TranscoderError> {
        self.transcoder
            .decode(&CachedData::new(data.flags(), data.data().to_vec()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AdapterKey {
    value_type: TypeId,
    transcoder: usize,
}

impl AdapterKey {
    fn of<T: 'static>(transcoder: &SharedTranscoder<T>) -> Self {
        Self {
            value_type: TypeId::of::<T>(),
            transcoder: Arc::as_ptr(transcoder) as *const () as usize,
        }
    }
}

/// Lazily created adapters, one per distinct transcoder instance.
///
/// Entries are never evicted. Each adapter holds a clone of its transcoder's
/// `Arc`, so an address in the key cannot be reused by another transcoder
/// while the entry exists.
#[derive(Default)]
pub struct AdapterCache {
    adapters: DashMap<AdapterKey, Arc<dyn Any + Send + Sync>>,
}

impl AdapterCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the adapter for `transcoder`, creating it on first use.
    pub fn get_or_create<T: 'static>(
        &self,
        transcoder: &SharedTranscoder<T>,
    ) -> Arc<TranscoderAdapter<T>> {
        let key = AdapterKey::of(transcoder);

        // The shard lock is held across lookup and insert.
        let adapter = self
            .adapters
            .entry(key)
            .or_insert_with(|| {
                armature_log::debug!(
                    "Creating transcoder adapter for {}",
                    std::any::type_name::<T>()
                );
                let adapter: Arc<dyn Any + Send + Sync> =
                    Arc::new(TranscoderAdapter::new(Arc::clone(transcoder)));
                adapter
            })
            .value()
            .clone();

        adapter
            .downcast::<TranscoderAdapter<T>>()
            .unwrap_or_else(|_| Arc::new(TranscoderAdapter::new(Arc::clone(transcoder))))
    }

    /// Number of adapters created so far.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapter has been created yet.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
