use capsule_shared::constants::names::MAX_NAME_LEN;
use capsule_shared::{CapsuleError, CapsuleResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Guest operating system family. Selects boot method and guest transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    #[default]
    Linux,
    Windows,
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsKind::Linux => write!(f, "linux"),
            OsKind::Windows => write!(f, "windows"),
        }
    }
}

/// Validate a VM, snapshot, or template name.
///
/// Names are 1-64 characters of ASCII alphanumerics, `-` and `_`. They are
/// used verbatim as file and directory names, so anything else is rejected.
pub fn validate_name(kind: &str, name: &str) -> CapsuleResult<()> {
    if name.is_empty() {
        return Err(CapsuleError::Validation(format!("{} name is empty", kind)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CapsuleError::Validation(format!(
            "{} name '{}' exceeds {} characters",
            kind, name, MAX_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(CapsuleError::Validation(format!(
            "{} name '{}' contains invalid character {:?}",
            kind, name, c
        )));
    }
    Ok(())
}
