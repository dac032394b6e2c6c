// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Deterministic names for the shared resources every instance rendezvous on.
// Names are derived from a namespace only (never random), so independently
// started terminals attach to the same segment, lock and bus.

/// FNV-1a 64-bit hash, used to shorten names on platforms with tight limits.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn to_hex(val: u64) -> String {
    format!("{val:016x}")
}

/// Maximum length for POSIX shm names. 0 disables truncation.
///
/// On macOS `PSHMNAMLEN` is 31. On Linux the limit is typically 255.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Produce a POSIX shm-safe name (with leading '/').
///
/// When `SHM_NAME_MAX > 0`, names that would exceed it are shortened to
/// `/<prefix>_<16-hex-FNV-1a-hash>`, keeping a readable prefix.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = SHM_NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);

    let body = &result[1..];
    let mut take = prefix_len.min(body.len());
    while !body.is_char_boundary(take) {
        take -= 1;
    }

    let mut shortened = String::with_capacity(SHM_NAME_MAX);
    shortened.push('/');
    shortened.push_str(&body[..take]);
    shortened.push('_');
    shortened.push_str(&to_hex(fnv1a_64(result.as_bytes())));
    shortened
}

/// The full set of named resources backing one supervisor namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub namespace: String,
    /// Shared segment holding the process table, instance bookkeeping and
    /// the lock guarding both.
    pub registry: String,
    /// Shared segment holding the per-instance mailboxes, their lock and
    /// the condition variable receivers block on.
    pub bus: String,
}

impl ResourceNames {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            registry: format!("{namespace}_registry"),
            bus: format!("{namespace}_bus"),
        }
    }
}
