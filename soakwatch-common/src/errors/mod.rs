//! Error catalog for soakwatch.
//!
//! Per-concern error enums live next to the code that raises them; this
//! module only carries the stable codes they are reported under.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
