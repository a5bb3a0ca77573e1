//! Snapshot envelopes for multi-projection state.
//!
//! The payload is the JSON form of the projector state, optionally gzipped.
//! Compatibility across releases rests on the recorded projector name and
//! version, not on the byte layout.

use crate::errors::{ProjectionError, ProjectionResult};
use crate::types::{EventId, SortableUniqueId};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// A multi-projection state ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableMultiProjectionState {
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Rust type name of the payload, informational.
    pub payload_type: String,
    /// Projector name.
    pub projector: String,
    /// Projector version that produced the payload.
    pub projector_version: String,
    /// Highest sortable id folded.
    pub last_sortable_unique_id: Option<SortableUniqueId>,
    /// Last folded event.
    pub last_event_id: Option<EventId>,
    /// Number of events folded.
    pub version: u64,
    /// Whether the actor had finished catching up.
    pub is_caught_up: bool,
    /// Whether the state was the safe state.
    pub is_safe: bool,
    /// Whether `payload` is gzipped.
    pub compressed: bool,
    /// Size of the JSON payload.
    pub original_size_bytes: usize,
    /// Size of `payload`.
    pub compressed_size_bytes: usize,
}

impl SerializableMultiProjectionState {
    pub(crate) fn encode_payload<S: Serialize>(
        state: &S,
        compress: bool,
    ) -> ProjectionResult<(Vec<u8>, usize)> {
        let json =
            serde_json::to_vec(state).map_err(|e| ProjectionError::Serialization(e.to_string()))?;
        let original = json.len();
        if !compress {
            return Ok((json, original));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| ProjectionError::Compression(e.to_string()))?;
        let bytes = encoder
            .finish()
            .map_err(|e| ProjectionError::Compression(e.to_string()))?;
        Ok((bytes, original))
    }

    /// Decodes the payload into the projector state.
    pub fn decode_payload<S: DeserializeOwned>(&self) -> ProjectionResult<S> {
        if !self.compressed {
            return serde_json::from_slice(&self.payload)
                .map_err(|e| ProjectionError::Serialization(e.to_string()));
        }
        let mut json = Vec::with_capacity(self.original_size_bytes);
        GzDecoder::new(self.payload.as_slice())
            .read_to_end(&mut json)
            .map_err(|e| ProjectionError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| ProjectionError::Serialization(e.to_string()))
    }
}

/// A snapshot either carried inline or stored elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SnapshotEnvelope {
    /// The state itself.
    Inline(SerializableMultiProjectionState),
    /// A pointer to the state in external blob storage.
    Offloaded {
        /// Blob key.
        key: String,
        /// Size of the stored blob.
        size_bytes: usize,
    },
}

impl SnapshotEnvelope {
    /// The inline state, or an error naming the blob to load.
    pub fn into_inline(self) -> ProjectionResult<SerializableMultiProjectionState> {
        match self {
            Self::Inline(state) => Ok(state),
            Self::Offloaded { key, .. } => Err(ProjectionError::OffloadedSnapshot { key }),
        }
    }
}

/// A snapshot serialized for a durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPersistenceData {
    /// The envelope as JSON.
    pub json: String,
    /// Length of `json` in bytes.
    pub size_bytes: usize,
    /// Position of the safe state the snapshot was built from.
    pub safe_position: super::ProjectionPosition,
}
