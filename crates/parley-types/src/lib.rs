//! Common types used throughout `parley`.
//!
//! This crate provides the object identifier and ref map types shared by
//! every negotiation component. Identifiers are opaque here: nothing in
//! Parley computes or verifies content hashes.

mod error;
mod object;

pub use error::TypesError;
pub use object::{ObjectId, ZERO_ID};

use std::collections::BTreeMap;

/// Mapping of ref name to the object it points to, as advertised by a peer.
pub type Refs = BTreeMap<String, ObjectId>;

/// Suffix marking a peeled tag entry in a ref advertisement.
pub const PEELED_SUFFIX: &str = "^{}";

/// A specialized Result type for type conversions.
pub type Result<T> = std::result::Result<T, TypesError>;
