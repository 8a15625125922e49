pub mod analyze;
pub mod ask;
pub mod expand;
pub mod ingest;
pub mod memory;
pub mod retrieve;
