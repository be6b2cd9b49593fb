//! Blob storage backends.
//!
//! The [`backend::BlobStore`] trait abstracts over where content bytes
//! physically live.  Implementations include local disk and memory; keys
//! are minted by [`keys`].

pub mod backend;
pub mod keys;
pub mod local;
pub mod memory;
