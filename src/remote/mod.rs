//! Everything that talks to the remote work item service.

pub mod api_types;
pub mod auth;
pub mod batch;
pub mod client;
pub mod error;
pub mod rate_limit;
pub mod resilience;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{BatchOptions, BatchResult, CommentListing, ErrorPolicy, Expand, RestClient};
pub use error::{ApiError, ErrorKind};
pub use resilience::OperationKind;
pub use types::{CommentRecord, SyncCursor, WorkItemRecord, WorkItemRef};
