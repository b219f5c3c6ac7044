//! Process-wide default context.
//!
//! Formatting helpers (panic hooks, `print!`-style macros, assert
//! reporters) want an ambient log sink rather than a threaded-through
//! handle. One slot holds the process default; publication and
//! replacement are atomic pointer swaps, so installing a new context
//! never exposes a half-built one.

use crate::context::Context;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

static DEFAULT_CTX: AtomicPtr<Context> = AtomicPtr::new(ptr::null_mut());

/// Publishes `ctx` as the process default, returning the previous
/// default if one was installed.
pub fn install_default(ctx: Box<Context>) -> Option<Box<Context>> {
    let prev = DEFAULT_CTX.swap(Box::into_raw(ctx), Ordering::AcqRel);
    if prev.is_null() {
        None
    } else {
        Some(unsafe { Box::from_raw(prev) })
    }
}

/// Removes and returns the process default, if any. The region itself is
/// left alone; call [`Context::destroy`] separately to tear it down.
pub fn take_default() -> Option<Box<Context>> {
    let prev = DEFAULT_CTX.swap(ptr::null_mut(), Ordering::AcqRel);
    if prev.is_null() {
        None
    } else {
        Some(unsafe { Box::from_raw(prev) })
    }
}

/// Runs `f` against the default context, or returns `None` when no
/// default is installed.
///
/// The slot is emptied for the duration of the call and restored after,
/// so a replacement racing the call simply wins the slot and the old
/// context dies here when `f` returns. A nested `with_default` inside
/// `f` sees no default; re-entrant formatting goes through the
/// context's own lock recursion instead.
pub fn with_default<R>(f: impl FnOnce(&mut Context) -> R) -> Option<R> {
    let mut ctx = take_default()?;
    let out = f(&mut ctx);
    // Put it back unless a replacement landed meanwhile; if one did, the
    // replacement stands and the context we held retires here.
    let raw = Box::into_raw(ctx);
    if DEFAULT_CTX
        .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        drop(unsafe { Box::from_raw(raw) });
    }
    Some(out)
}
