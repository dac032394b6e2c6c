// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub mod posix;

#[cfg(not(unix))]
compile_error!("procx coordinates POSIX processes and only builds on unix targets");

pub use posix::PlatformMutex;
pub use posix::PlatformShm;
