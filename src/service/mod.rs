//service/mod.rs
pub mod archive_service;
pub mod dedup;
pub mod hashing;
pub mod query;

pub use archive_service::{ArchiveService, FileInfo};
pub use dedup::{DedupGuard, HASH_FIELD};
pub use hashing::{hash_stream, ContentHash};
pub use query::{QueryBuilder, QuerySpec};
