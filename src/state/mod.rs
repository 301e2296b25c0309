pub mod store;

pub use store::{
    HeaderSummary, MessageRecord, NewMessage, StateStore, StoreError, StoreResult, SyncStatus,
};
