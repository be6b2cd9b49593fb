//! Metadata storage layer.
//!
//! The metadata store keeps track of users, roles, assets, versions and
//! the audit ledger.  The [`store::MetadataStore`] trait defines the
//! interface; [`sqlite::SqliteMetadataStore`] is the default implementation.

pub mod sqlite;
pub mod store;
