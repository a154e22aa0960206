//! Lazy blob transfer between peers.
//!
//! When a committed entry names a `(key, version)` the local store lacks,
//! this module requests it from the originating node, chunk by chunk, and
//! persists the result through the change store. Transfers resume via the
//! `start` byte offset; `old_version` is carried for a future
//! delta-encoding extension and the full object is returned for now.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use driftfs_raft::message::Envelope;
use driftfs_raft::{NodeId, Transport};

use crate::store::{ChangeStore, Scratch, StoreError};

/// Module name for blob transfer traffic.
pub const MODULE: &str = "changetx";

/// Bytes of blob data carried per response, before base64 expansion. Both
/// ends of a transfer rely on this: a response shorter than one chunk
/// marks the end of the object.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Status of a transfer response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ErrorCode {
    Ok,
    NoKey,
    NoVersion,
}

impl From<ErrorCode> for u32 {
    fn from(value: ErrorCode) -> u32 {
        match value {
            ErrorCode::Ok => 0,
            ErrorCode::NoKey => 1,
            ErrorCode::NoVersion => 2,
        }
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = String;

    fn try_from(value: u32) -> Result<ErrorCode, String> {
        match value {
            0 => Ok(ErrorCode::Ok),
            1 => Ok(ErrorCode::NoKey),
            2 => Ok(ErrorCode::NoVersion),
            other => Err(format!("unknown transfer error code {other}")),
        }
    }
}

/// A request for a slice of `(key, version)` starting at byte `start`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub key: String,
    pub version: String,
    pub old_version: String,
    pub start: u64,
}

/// One chunk of blob data, base64-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub key: String,
    pub version: String,
    pub old_version: String,
    pub start: u64,
    pub data: String,
    pub error_code: ErrorCode,
}

/// Transfer traffic, tagged like every other module payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransferMessage {
    Request(FetchRequest),
    Response(FetchResponse),
}

/// An in-progress fetch of one `(key, version)`.
struct Fetch {
    origin: NodeId,
    scratch: Scratch,
    received: u64,
}

/// The transfer engine for one node.
pub struct ChangeTransfer {
    chunk_size: usize,
    inflight: std::collections::BTreeMap<(String, String), Fetch>,
    arrivals: UnboundedSender<(String, String)>,
}

impl ChangeTransfer {
    /// `arrivals` receives `(key, version)` once a fetched blob is fully
    /// persisted.
    pub fn new(arrivals: UnboundedSender<(String, String)>) -> ChangeTransfer {
        ChangeTransfer {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inflight: std::collections::BTreeMap::new(),
            arrivals,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> ChangeTransfer {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Begin fetching `(key, version)` from `origin` unless the blob is
    /// already present or a fetch is under way. Safe to call every tick.
    pub fn fetch(
        &mut self,
        key: &str,
        version: &str,
        origin: &NodeId,
        store: &mut ChangeStore,
        transport: &mut dyn Transport,
    ) -> Result<(), StoreError> {
        let slot = (key.to_owned(), version.to_owned());
        if store.exists(key, version) || self.inflight.contains_key(&slot) {
            return Ok(());
        }

        let scratch = store.scratch(key)?;
        tracing::info!(key, version, %origin, "requesting blob");
        self.inflight.insert(
            slot,
            Fetch {
                origin: origin.clone(),
                scratch,
                received: 0,
            },
        );
        transport.send(
            origin,
            Envelope::new(
                MODULE,
                &TransferMessage::Request(FetchRequest {
                    key: key.to_owned(),
                    version: version.to_owned(),
                    old_version: String::new(),
                    start: 0,
                }),
            ),
        );
        Ok(())
    }

    /// Handle one inbound transfer envelope.
    pub fn handle_message(
        &mut self,
        from: &NodeId,
        message: TransferMessage,
        store: &mut ChangeStore,
        transport: &mut dyn Transport,
    ) {
        match message {
            TransferMessage::Request(request) => {
                self.handle_request(from, request, store, transport)
            }
            TransferMessage::Response(response) => {
                self.handle_response(response, store, transport)
            }
        }
    }

    /// Answer a peer's request for a chunk of one of our blobs.
    fn handle_request(
        &mut self,
        from: &NodeId,
        request: FetchRequest,
        store: &mut ChangeStore,
        transport: &mut dyn Transport,
    ) {
        let (data, error_code) = if !store.exists_key(&request.key) {
            (String::new(), ErrorCode::NoKey)
        } else if !store.exists(&request.key, &request.version) {
            (String::new(), ErrorCode::NoVersion)
        } else {
            match store.read(&request.key, &request.version, request.start, self.chunk_size) {
                Ok(bytes) => (BASE64.encode(bytes), ErrorCode::Ok),
                Err(err) => {
                    tracing::warn!(key = %request.key, version = %request.version, error = %err,
                        "failed to read blob for transfer");
                    (String::new(), ErrorCode::NoVersion)
                }
            }
        };

        if error_code != ErrorCode::Ok {
            tracing::info!(key = %request.key, version = %request.version, ?error_code, %from,
                "refusing blob request");
        }

        transport.send(
            from,
            Envelope::new(
                MODULE,
                &TransferMessage::Response(FetchResponse {
                    key: request.key,
                    version: request.version,
                    old_version: request.old_version,
                    start: request.start,
                    data,
                    error_code,
                }),
            ),
        );
    }

    /// Persist one received chunk, requesting the next or completing the
    /// transfer.
    fn handle_response(
        &mut self,
        response: FetchResponse,
        store: &mut ChangeStore,
        transport: &mut dyn Transport,
    ) {
        let slot = (response.key.clone(), response.version.clone());
        let Some(mut fetch) = self.inflight.remove(&slot) else {
            tracing::warn!(key = %response.key, version = %response.version,
                "response for a transfer we no longer want");
            return;
        };

        if response.error_code != ErrorCode::Ok {
            tracing::warn!(key = %response.key, version = %response.version,
                error_code = ?response.error_code, "peer refused transfer");
            store.discard_scratch(fetch.scratch);
            return;
        }

        if response.start != fetch.received {
            tracing::warn!(key = %response.key, expected = fetch.received, got = response.start,
                "transfer chunk out of order; restarting");
            store.discard_scratch(fetch.scratch);
            return;
        }

        let bytes = match BASE64.decode(response.data.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(key = %response.key, error = %err, "undecodable transfer chunk");
                store.discard_scratch(fetch.scratch);
                return;
            }
        };

        if let Err(err) = store.append_scratch(&fetch.scratch, &bytes) {
            tracing::warn!(key = %response.key, error = %err, "failed to persist transfer chunk");
            store.discard_scratch(fetch.scratch);
            return;
        }
        fetch.received += bytes.len() as u64;

        if bytes.len() < self.chunk_size {
            // Short chunk: the object is complete.
            match store.commit_scratch(fetch.scratch, &response.version) {
                Ok(()) => {
                    tracing::info!(key = %response.key, version = %response.version,
                        bytes = fetch.received, "blob arrived");
                    let _ = self.arrivals.send(slot);
                }
                Err(StoreError::Exists { .. }) => {
                    // Raced with another path that produced the version.
                    let _ = self.arrivals.send(slot);
                }
                Err(err) => {
                    tracing::warn!(key = %response.key, error = %err, "failed to commit blob");
                }
            }
        } else {
            // Carry on from where this chunk left off.
            let origin = fetch.origin.clone();
            let start = fetch.received;
            self.inflight.insert(slot, fetch);
            transport.send(
                &origin,
                Envelope::new(
                    MODULE,
                    &TransferMessage::Request(FetchRequest {
                        key: response.key,
                        version: response.version,
                        old_version: response.old_version,
                        start,
                    }),
                ),
            );
        }
    }
}
