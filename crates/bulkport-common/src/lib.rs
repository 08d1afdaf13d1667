//! Bulkport Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Bulkport workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` variables
//! - **Paths**: canonical hierarchical resource paths used for locking and storage keys
//! - **Units**: byte-size parsing and formatting for configuration values
//!
//! # Example
//!
//! ```
//! use bulkport_common::paths::ResourcePath;
//!
//! let folder = ResourcePath::parse("companies//acme/./catalog/")?;
//! assert_eq!(folder.as_str(), "/companies/acme/catalog");
//! # Ok::<(), bulkport_common::CommonError>(())
//! ```

pub mod error;
pub mod logging;
pub mod paths;
pub mod units;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use paths::ResourcePath;
