#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_long_first_doc_paragraph)]
#![allow(clippy::too_many_arguments)]

//! An embedded, channelized object-graph persistence engine.
//!
//! Objects are written through a [`Storer`](storer::Storer), which
//! discovers and durably commits an entire reachable subgraph atomically;
//! they're read back by oid through a [`Store`](store::Store) handle, which
//! also owns recovery, the background [`housekeeping`] worker, and the
//! pluggable [`bfs`] backend every byte ultimately passes through.

pub mod bfs;
pub mod channel;
pub mod config;
pub mod data_file;
pub mod entity_cache;
pub mod entity_index;
pub mod error;
pub mod housekeeping;
pub mod oid;
pub mod record;
pub mod root;
pub mod store;
pub mod storer;
pub mod type_dictionary;
pub mod type_handler;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use oid::{Oid, Tid};
pub use storer::Storer;
pub use store::{Store, StoreHealth, StoreState};
pub use type_handler::{TypeHandler, TypeHandlerRegistry};
