use thiserror::Error;

use crate::cache::StoreError;
use crate::remote::RemoteError;

/// Errors surfaced across the loader/controller boundary. Collaborator
/// failures pass through unchanged so callers see the underlying cause.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An "older/newer messages" request could not resolve a boundary anchor:
    /// no explicit anchor was supplied and no message has ever been loaded.
    #[error("channel has no messages to paginate from")]
    ChannelEmptyMessages,
    /// The observer's initial read of the local store failed. The owning
    /// controller moves to a failed state; there is no automatic retry.
    #[error("initial local fetch failed: {0}")]
    LocalFetchFailed(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}
