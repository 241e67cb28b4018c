//! Shared types

mod binary;
mod errors;

pub use binary::LanguageServerBinary;
pub use errors::{LspError, Result, ShutdownErrors};
