//! Runtime facade, configuration, and on-disk layout.

pub mod constants;
mod core;
pub mod layout;
pub mod lock;
pub mod options;
pub mod types;

pub use self::core::CapsuleRuntime;
pub use layout::FilesystemLayout;
pub use lock::VmLocks;
pub use options::CapsuleOptions;
pub use types::{OsKind, validate_name};
