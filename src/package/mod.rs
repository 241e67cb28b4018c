//! Package identifiers, platforms and install strategies

mod parser;
mod platform;
mod source;

pub use parser::{parse_package_id, resolve_method, LATEST};
pub use platform::{Platform, TemplateError};
pub use source::{Ecosystem, GitReference, InstallationMethod, PackageSource};
