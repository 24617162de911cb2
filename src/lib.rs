pub mod config;
pub mod error;
pub mod inference;
pub mod models;
pub mod transfer;

pub use error::{DockError, Result};
