// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cooperative stop primitive for background loops, and the SIGINT counter
// behind the three-press shutdown confirmation.
//
// The signal handler only bumps an atomic counter. Deregistration, joins
// and teardown all happen on normal threads after the counter is observed.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One-shot stop flag that sleeping loops can wait on.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`. Returns `true` as soon as the signal fires.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stopped = cv
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// SIGINT counter
// ---------------------------------------------------------------------------

static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_interrupt(_sig: libc::c_int) {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}

/// Replace the default SIGINT action with a handler that only counts.
pub fn install_interrupt_counter() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// SIGINTs received since the counter was installed.
pub fn interrupt_count() -> usize {
    INTERRUPTS.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing new since the last poll.
    Idle,
    /// A press that does not yet complete the sequence.
    Warned { seen: usize, required: usize },
    /// The final press; run the orderly shutdown.
    Confirmed,
}

/// Turns the raw interrupt count into shutdown stages.
#[derive(Debug)]
pub struct ShutdownSequence {
    required: usize,
    origin: usize,
    reported: usize,
}

impl ShutdownSequence {
    pub fn new(required: usize) -> Self {
        Self::starting_at(required, interrupt_count())
    }

    fn starting_at(required: usize, origin: usize) -> Self {
        Self {
            required: required.max(1),
            origin,
            reported: origin,
        }
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn poll(&mut self) -> Stage {
        self.advance(interrupt_count())
    }

    /// Presses are counted from construction, so earlier interrupts never
    /// count toward this sequence.
    fn advance(&mut self, total: usize) -> Stage {
        if total <= self.reported {
            return Stage::Idle;
        }
        let seen = total - self.origin;
        self.reported = total;
        if seen >= self.required {
            Stage::Confirmed
        } else {
            Stage::Warned {
                seen,
                required: self.required,
            }
        }
    }
}
