//! Utility functions shared by the fetch pipeline.
//!
//! - **URL validation**: scheme checks plus optional rejection of local and
//!   private hosts

mod url_validator;

pub use url_validator::{validate_url, UrlValidationError};
