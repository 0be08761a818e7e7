//! Filesystem primitives shared by the scanner, the synchronizer and the
//! file-backed store.

pub mod atomic;
pub mod digest;
pub mod mtime;

pub use atomic::write_atomic;
pub use digest::{hash_bytes, hash_file};
pub use mtime::{mtime_millis, set_mtime_millis};
