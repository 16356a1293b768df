//! # courier-shared
//!
//! Identifiers and naming rules shared by every Courier component: user ids,
//! topic-name classification, access modes and object headers.

pub mod access;
pub mod constants;
pub mod error;
pub mod types;

pub use access::{AccessMode, DefaultAccess};
pub use error::TypesError;
pub use types::{ObjHeader, TopicCat, Uid};
