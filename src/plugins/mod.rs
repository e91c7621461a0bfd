pub mod indexer;
pub mod lint;
pub mod sync;
