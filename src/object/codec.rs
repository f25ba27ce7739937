use std::marker::PhantomData;

use crate::Object;
use crate::Result;

/// Converts objects to and from the byte payloads handed to storage.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(
        &self,
        obj: &T,
    ) -> Result<Vec<u8>>;

    fn decode(
        &self,
        data: &[u8],
    ) -> Result<T>;
}

/// JSON codec. Object maps are ordered, so identical objects always encode
/// to identical bytes.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Object> Codec<T> for JsonCodec<T> {
    fn encode(
        &self,
        obj: &T,
    ) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(obj)?)
    }

    fn decode(
        &self,
        data: &[u8],
    ) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}
