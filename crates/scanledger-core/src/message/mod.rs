//! Message-stream reconciliation.
//!
//! Incoming pages of timestamped messages may overlap, duplicate, or outrun
//! previously-cached data. The reconciler finds the overlap boundary of each
//! page, merges only what is new, doubles the fetch size (bounded) when
//! continuity cannot be proven, and back-fills comment threads for read
//! messages.

mod index;
mod model;
mod reconciler;

pub use index::{MessageRef, TokenIndex};
pub use model::{Message, MessageStream, ReadStatus};
pub use reconciler::{
    DEFAULT_PAGE_SIZE, FULL_HISTORY_COUNT, MAX_FETCH_SIZE, MessageReconciler, REFRESH_DEBOUNCE,
};
