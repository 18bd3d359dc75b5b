// Continuation snapshots.
//
// The object graph rooted at a suspended execution stack - prototypes,
// tables, upvalue cells, closures, frames and the stack bookkeeping - is
// flattened into index-linked records and encoded with bincode. Sharing
// is preserved by reference id, which also breaks cycles, so the encoded
// container is a plain DAG. Host functions are serialized as their
// registered names and rebound through the VM's registry on restore.

mod deserializer;
mod graph;
mod serializer;

pub use deserializer::deserialize_execution_context;
pub use graph::SNAPSHOT_VERSION;
pub use serializer::serialize_execution_context;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot encoding failed: {0}")]
    Encode(#[source] bincode::Error),
    #[error("snapshot decoding failed: {0}")]
    Decode(#[source] bincode::Error),
    #[error("snapshot version {0} not supported")]
    UnsupportedVersion(u32),
    #[error("unknown host function '{0}' in snapshot")]
    UnknownHost(String),
    #[error("snapshot contains an open upvalue cell")]
    OpenUpvalue,
    #[error("snapshot contains no frames")]
    EmptyStack,
    #[error("reference out of range in snapshot")]
    BadReference,
    #[error("unsupported constant in serialized prototype")]
    BadConstant,
}
