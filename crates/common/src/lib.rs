//! Common types for the news aggregation services

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::ApiKey;
