//! Types shared between the ovfimport engine and its consumers.

pub mod errors;

pub use errors::{ImportError, ImportResult};
