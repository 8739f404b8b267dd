// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// POSIX shm-name handling for named rings. The ring header stores the
// name in a fixed 64-byte field, so over-long names are rejected rather
// than truncated.

use crate::error::{Error, Result};

/// Maximum useful bytes in a ring name, including the leading '/'.
/// One byte of the header field is reserved for the NUL terminator.
pub const NAME_MAX: usize = 63;

/// Normalise `name` to its POSIX form (leading '/'), validating length
/// and charset.
///
/// Rules: the result is at most [`NAME_MAX`] bytes, contains exactly one
/// '/' (the leading one), and no NUL bytes.
pub fn make_shm_name(name: &str) -> Result<String> {
    let bad = || Error::BadName {
        name: name.to_string(),
    };

    let body = name.strip_prefix('/').unwrap_or(name);
    if body.is_empty() || body.contains('/') || body.contains('\0') {
        return Err(bad());
    }

    let posix = format!("/{body}");
    if posix.len() > NAME_MAX {
        return Err(bad());
    }
    Ok(posix)
}
