//! Error kinds surfaced by a session. Codec, storage and transport errors
//! live beside their modules and are re-exported here.

pub use crate::common::protocol::CodecError;
pub use crate::common::world::WorldError;
pub use crate::storage::StoreError;
pub use crate::transport::TransportError;

use crate::common::protocol::MessageTag;
use crate::session::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The message is valid but not in the session's current state.
    #[error("{tag:?} not allowed while {state:?}")]
    Guard { tag: MessageTag, state: SessionState },
    /// A server-to-client message arrived from a client.
    #[error("{0:?} is not accepted from clients")]
    Unexpected(MessageTag),
    #[error(transparent)]
    OutOfRange(#[from] WorldError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl SessionError {
    /// Whether the triggering message should simply be dropped. Only
    /// storage failures are reported as failed operations.
    pub fn is_dropped_message(&self) -> bool {
        !matches!(self, SessionError::Storage(_))
    }
}
