//! Reference backend for `aot-rs` that treats host memory as the device.
//!
//! [`HostCompilationService`] plugs into [`aot_rs::aot::CompileOnlyClient`];
//! [`HostExecutable`] loads the resulting objects and runs them on a
//! [`HostStreamExecutor`].

pub mod artifact;
pub mod device;
pub mod features;
pub mod library;
pub mod loader;
pub mod runtime_library;
pub mod service;

pub use artifact::{ArtifactError, ArtifactResult, ObjectFile, HOST_OBJECT_VERSION};
pub use device::{HostStream, HostStreamExecutor};
pub use features::HostTargetFeatures;
pub use library::{CustomCallLibrary, LibraryError};
pub use loader::{HostExecutable, LoadError, LoadResult};
pub use runtime_library::register_runtime_library;
pub use service::{HostCompilationService, DEFAULT_MAX_OPERANDS};

/// Target triple of the running process, in the form the service accepts.
pub fn host_target_triple() -> String {
    let arch = std::env::consts::ARCH;
    let rest = if cfg!(target_os = "macos") {
        "apple-darwin"
    } else if cfg!(target_os = "windows") {
        "pc-windows-msvc"
    } else {
        "unknown-linux-gnu"
    };
    format!("{arch}-{rest}")
}
