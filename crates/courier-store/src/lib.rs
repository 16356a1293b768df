//! # courier-store
//!
//! Persistence for the Courier messaging hub on top of a key/index-only
//! document store with conditional single-row writes, bounded batches and
//! cursor pagination.
//!
//! A [`Store`] wraps a [`backend::Backend`] and provides async CRUD for every
//! entity: users and their tags, credentials, topics, subscriptions,
//! messages and push devices. Uniqueness, cross-entity joins and message
//! retention are implemented here, since the backend offers none of them.
//! Amazon DynamoDB is supported behind the `dynamodb` feature; an in-memory
//! backend is always available.

pub mod backend;
pub mod clock;
pub mod config;
pub mod fanout;
pub mod item;
pub mod models;
pub mod pager;
pub mod retention;
pub mod schema;

mod auth;
mod bootstrap;
mod conditional;
mod devices;
mod discovery;
mod error;
mod messages;
mod store;
mod subscriptions;
mod topics;
mod users;

pub use backend::{Backend, MemoryBackend, Patch};
pub use clock::{Clock, FixedClock, SystemClock};
pub use conditional::absorb_conflict;
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use models::*;
pub use store::Store;

#[cfg(feature = "dynamodb")]
pub use backend::DynamoBackend;
