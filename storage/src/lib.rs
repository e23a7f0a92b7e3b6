pub mod index;
pub mod store;
pub mod wal;

pub use store::{AppendedMessage, ChunkHit, HistoryPage, Repository, StoreError};
