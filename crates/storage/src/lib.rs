mod error;
mod index;
mod journal;
mod memory;
mod record;
mod replay;
mod traits;

pub mod conformance;

pub use error::StorageError;
pub use journal::JournalStore;
pub use memory::MemoryStore;
pub use record::{Annotations, AppendOutcome, ReadQuery, ReplayPage, StoredPosition, StoredRecord};
pub use replay::{Replay, DEFAULT_PAGE_SIZE};
pub use traits::ReplayStore;
