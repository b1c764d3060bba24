//! Binary streams: a stream carrying start/chunk/end items.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::content::stream::CoStream;
use crate::error::{CoreError, Result};
use crate::ids::CoId;
use crate::transaction::DecodedTransaction;

const CHUNK_PREFIX: &str = "binary_U";

/// One item in a binary stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BinaryStreamItem {
    #[serde(rename = "start", rename_all = "camelCase")]
    Start {
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_size_bytes: Option<u64>,
    },
    #[serde(rename = "chunk")]
    Chunk { chunk: String },
    #[serde(rename = "end")]
    End,
}

impl BinaryStreamItem {
    pub fn chunk(data: &[u8]) -> Self {
        BinaryStreamItem::Chunk {
            chunk: format!("{}{}", CHUNK_PREFIX, hex::encode(data)),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| CoreError::EncodingError(e.to_string()))
    }
}

/// A reassembled binary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryStreamInfo {
    pub mime_type: String,
    pub file_name: Option<String>,
    pub total_size_bytes: Option<u64>,
    pub chunks: Vec<Bytes>,
    pub finished: bool,
}

impl BinaryStreamInfo {
    /// All chunks concatenated.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

/// Merged view of a binary stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryCoStream {
    stream: CoStream,
}

impl BinaryCoStream {
    pub fn from_transactions(id: CoId, transactions: &[DecodedTransaction]) -> Self {
        Self {
            stream: CoStream::from_transactions(id, transactions),
        }
    }

    pub fn id(&self) -> CoId {
        self.stream.id()
    }

    pub fn stream(&self) -> &CoStream {
        &self.stream
    }

    /// Reassemble the upload from the first session that started one.
    ///
    /// Returns `None` if nothing was started, if a chunk is malformed, or if
    /// the upload is unfinished and `allow_unfinished` is false.
    pub fn info(&self, allow_unfinished: bool) -> Option<BinaryStreamInfo> {
        let session = self.stream.sessions().find(|s| {
            self.stream.session_view(s).first().map_or(false, |item| {
                matches!(
                    serde_json::from_value::<BinaryStreamItem>(item.value.clone()),
                    Ok(BinaryStreamItem::Start { .. })
                )
            })
        })?;

        let mut items = self.stream.session_view(session).iter();
        let first = serde_json::from_value::<BinaryStreamItem>(items.next()?.value.clone()).ok()?;
        let BinaryStreamItem::Start {
            mime_type,
            file_name,
            total_size_bytes,
        } = first
        else {
            return None;
        };

        let mut info = BinaryStreamInfo {
            mime_type,
            file_name,
            total_size_bytes,
            chunks: Vec::new(),
            finished: false,
        };

        for item in items {
            match serde_json::from_value::<BinaryStreamItem>(item.value.clone()) {
                Ok(BinaryStreamItem::Chunk { chunk }) => {
                    let decoded = chunk
                        .strip_prefix(CHUNK_PREFIX)
                        .and_then(|h| hex::decode(h).ok());
                    match decoded {
                        Some(data) => info.chunks.push(Bytes::from(data)),
                        None => {
                            warn!("Malformed chunk in binary stream {}", self.id());
                            return None;
                        }
                    }
                }
                Ok(BinaryStreamItem::End) => {
                    info.finished = true;
                    break;
                }
                Ok(BinaryStreamItem::Start { .. }) => {
                    warn!("Repeated start in binary stream {}", self.id());
                }
                Err(e) => {
                    warn!("Malformed item in binary stream {}: {}", self.id(), e);
                    return None;
                }
            }
        }

        (info.finished || allow_unfinished).then_some(info)
    }

    /// Chunks of a finished upload.
    pub fn chunks(&self) -> Option<Vec<Bytes>> {
        self.info(false).map(|info| info.chunks)
    }
}
