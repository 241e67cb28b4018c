//! Language server installation
//!
//! One backend per package ecosystem, all driven through the
//! [`PackageManager`] contract by a single [`ServerInstaller`].

mod backend;
mod cargo;
mod command;
mod gem;
mod github;
mod golang;
mod npm;
mod orchestrator;
mod pip;

pub use backend::{BackendProvider, DefaultBackends, PackageManager};
pub use cargo::CargoBackend;
pub use command::{CommandRunner, CommandSpec, LineStream};
pub use gem::GemBackend;
pub use github::{GitSourceBackend, GithubReleaseBackend};
pub use golang::GoBackend;
pub use npm::NpmBackend;
pub use orchestrator::{InstallOperation, InstallPhase, ServerInstaller};
pub use pip::PipBackend;
