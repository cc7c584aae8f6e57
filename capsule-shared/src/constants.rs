//! Protocol constants shared by host and guest.

/// Guest agent wire protocol.
pub mod guest_protocol {
    /// Size of the big-endian length prefix preceding every frame.
    pub const LENGTH_PREFIX_BYTES: usize = 4;

    /// Largest frame either side will accept (64 MiB).
    pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
}

/// Limits on user-supplied identifiers.
pub mod names {
    pub const MAX_NAME_LEN: usize = 64;
}
