//! # scanledger-patch
//!
//! Structural diff/patch algebra over nested JSON documents.
//!
//! A [`Document`] is an arbitrarily nested JSON value. A [`Patch`] describes
//! how to turn one document into another: replace a value wholesale, delete a
//! key, or recursively update a nested document. On the wire a deletion is the
//! JSON literal `null`; in memory it is the explicit [`Patch::Delete`]
//! variant, so a tombstone can never be mistaken for data.
//!
//! ## Quick Start
//!
//! ```
//! use scanledger_patch::{Document, diff};
//! use serde_json::json;
//!
//! let before = json!({"stars": {"0": {"name": "Sol"}}, "tick": 1});
//! let after = json!({"stars": {"0": {"name": "Sol", "owner": 2}}, "tick": 2});
//!
//! let patch = diff(&before, &after).unwrap();
//! assert_eq!(patch.apply(&before).unwrap(), after);
//! ```
//!
//! ## The round-trip law
//!
//! For all tombstone-free documents `a` and `b`:
//! `diff(a, b).apply(a) == b`, and `diff(a, a)` is `None`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod error;
mod patch;

pub use error::{Error, Result};
pub use patch::{Document, Patch, diff, find_tombstone};
