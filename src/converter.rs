//! Pluggable payload encoding and large-payload externalization.
//!
//! Collects what would otherwise be ad hoc `serde_json::to_value`/
//! `from_value` calls scattered across the dispatchers into one seam,
//! and adds large-payload externalization via opaque blob-store tokens.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Payloads above this size (bytes, JSON-encoded) are externalized to the
/// [`PayloadStore`] and replaced in history/actions with an `ext:v1:`
/// token. Matches the default `externalPayloadThreshold` of 60 KiB.
pub const EXTERNALIZATION_THRESHOLD_BYTES: usize = 60 * 1024;

const TOKEN_PREFIX: &str = "ext:v1:";

#[derive(Debug, thiserror::Error)]
pub enum ConverterError {
    #[error("failed to serialize value: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize value: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("payload store error: {0}")]
    Store(String),

    #[error("externalized payload token not found: {0}")]
    TokenNotFound(String),
}

/// Converts typed values to and from the wire's `serde_json::Value`
/// representation. A trait seam so callers can swap in e.g. a compressing
/// or encrypting converter without touching the dispatcher.
pub trait DataConverter: Send + Sync {
    fn to_value<T: Serialize>(&self, value: &T) -> Result<Value, ConverterError>;
    fn from_value<T: DeserializeOwned>(&self, value: Value) -> Result<T, ConverterError>;
}

/// Default converter: plain `serde_json`, with payloads above
/// [`EXTERNALIZATION_THRESHOLD_BYTES`] pushed into a [`PayloadStore`] and
/// replaced by a reference token.
pub struct JsonDataConverter<S: PayloadStore> {
    store: S,
}

impl<S: PayloadStore> JsonDataConverter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Serializes `value`, externalizing it through the store if the
    /// encoded form exceeds the threshold. Returns the value (or token
    /// wrapper) to place on the wire.
    pub fn externalize<T: Serialize>(&self, value: &T) -> Result<Value, ConverterError> {
        let encoded = serde_json::to_vec(value).map_err(ConverterError::Serialize)?;
        if encoded.len() <= EXTERNALIZATION_THRESHOLD_BYTES {
            return serde_json::to_value(value).map_err(ConverterError::Serialize);
        }
        let token = self
            .store
            .put(&encoded)
            .map_err(|e| ConverterError::Store(e.to_string()))?;
        Ok(Value::String(format!("{TOKEN_PREFIX}{token}")))
    }

    /// Resolves a value that may be an externalization token back into the
    /// real JSON payload.
    pub fn internalize(&self, value: Value) -> Result<Value, ConverterError> {
        if let Value::String(s) = &value {
            if let Some(token) = s.strip_prefix(TOKEN_PREFIX) {
                let bytes = self
                    .store
                    .get(token)
                    .map_err(|e| ConverterError::Store(e.to_string()))?
                    .ok_or_else(|| ConverterError::TokenNotFound(token.to_string()))?;
                return serde_json::from_slice(&bytes).map_err(ConverterError::Deserialize);
            }
        }
        Ok(value)
    }
}

impl<S: PayloadStore> DataConverter for JsonDataConverter<S> {
    fn to_value<T: Serialize>(&self, value: &T) -> Result<Value, ConverterError> {
        self.externalize(value)
    }

    fn from_value<T: DeserializeOwned>(&self, value: Value) -> Result<T, ConverterError> {
        let resolved = self.internalize(value)?;
        serde_json::from_value(resolved).map_err(ConverterError::Deserialize)
    }
}

/// Blob-like payload store collaborator. Only `put`/`get` are
/// needed by the converter; retention and garbage collection are the
/// store's concern, out of scope here.
pub trait PayloadStore: Send + Sync {
    type Error: std::fmt::Display;

    fn put(&self, bytes: &[u8]) -> Result<String, Self::Error>;
    fn get(&self, token: &str) -> Result<Option<Vec<u8>>, Self::Error>;
}

/// In-memory store used by tests and by embedded deployments that do not
/// need externalization to survive process restarts.
#[derive(Default)]
pub struct InMemoryPayloadStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadStore for InMemoryPayloadStore {
    type Error = std::convert::Infallible;

    fn put(&self, bytes: &[u8]) -> Result<String, Self::Error> {
        let token = uuid::Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext)).to_string();
        self.blobs.lock().unwrap().insert(token.clone(), bytes.to_vec());
        Ok(token)
    }

    fn get(&self, token: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.blobs.lock().unwrap().get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_stays_inline() {
        let conv = JsonDataConverter::new(InMemoryPayloadStore::new());
        let value = serde_json::json!({"a": 1});
        let out = conv.externalize(&value).unwrap();
        assert_eq!(out, value);
    }

    #[test]
    fn large_payload_is_externalized_and_resolves() {
        let conv = JsonDataConverter::new(InMemoryPayloadStore::new());
        let big = "x".repeat(EXTERNALIZATION_THRESHOLD_BYTES + 10);
        let out = conv.externalize(&big).unwrap();
        let token = out.as_str().unwrap();
        assert!(token.starts_with(TOKEN_PREFIX));

        let resolved = conv.internalize(out).unwrap();
        let resolved_str: String = serde_json::from_value(resolved).unwrap();
        assert_eq!(resolved_str, big);
    }

    #[test]
    fn missing_token_errors() {
        let conv = JsonDataConverter::new(InMemoryPayloadStore::new());
        let err = conv
            .internalize(Value::String(format!("{TOKEN_PREFIX}nonexistent")))
            .unwrap_err();
        assert!(matches!(err, ConverterError::TokenNotFound(_)));
    }
}
