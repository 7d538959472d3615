// Background Synchronization Engine - scheduled full/incremental pulls

mod engine;

pub use engine::{SyncEngine, SyncRunResult, TableRunResult, TypeSyncStats};
