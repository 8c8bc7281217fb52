//! An embedded key-value store: a B+ tree of fixed-size pages managed by a
//! paged buffer cache, exposed through a cursor for ordered scans.
//!
//! This crate is a storage engine only — no REPL, no SQL, no command
//! dispatch. Callers open a [`Pager`], wrap it in a [`btree::Tree`], and
//! drive it with [`Row`] values.

pub mod btree;
pub mod cache;
pub mod cursor;
pub mod errors;
pub mod node;
pub mod pager;
pub mod row;

pub use btree::Tree;
pub use cursor::Cursor;
pub use errors::Error;
pub use pager::Pager;
pub use row::Row;
