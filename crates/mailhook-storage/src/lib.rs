//! Mailhook Storage - Message spool
//!
//! Scratch storage for in-flight raw messages. Each message gets a
//! collision-resistant id so concurrent connections never share a path.

pub mod spool;

pub use spool::{SpoolWriter, TempStore};
