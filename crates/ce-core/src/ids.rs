// SPDX-License-Identifier: MIT OR Apache-2.0
//! Opaque id formats.

use uuid::Uuid;

/// Prefix of every file id.
pub const FILE_ID_PREFIX: &str = "fid_";

/// Mint a new file id: `fid_` followed by 32 lowercase hex characters.
pub fn new_file_id() -> String {
    format!("{FILE_ID_PREFIX}{}", Uuid::new_v4().simple())
}

/// Mint a new job id: 32 lowercase hex characters.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Returns `true` if `raw` has the exact file id shape. Clients treat file
/// ids opaquely; this check exists so the executor can tell a file handle
/// from a raw artifact value.
pub fn is_file_id(raw: &str) -> bool {
    let Some(hex) = raw.strip_prefix(FILE_ID_PREFIX) else {
        return false;
    };
    hex.len() == 32 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
