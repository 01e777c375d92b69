mod cache;
pub mod sha256;

pub use cache::ChecksumCache;
