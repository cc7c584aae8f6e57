pub mod checksum;
pub mod process;

pub use checksum::{sha256_bytes, sha256_file};
pub use process::terminate_gracefully;
