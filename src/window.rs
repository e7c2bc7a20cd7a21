//! Common batching windows, for use as [`BatchRules::window`].
//!
//! A window is created when a batch starts accumulating keys; the batch is
//! dispatched the first time it's polled after the window completes. Any
//! `Fn() -> impl Future<Output = ()> + Unpin` works as a window; these cover
//! the usual cases.
//!
//! [`BatchRules::window`]: crate::BatchRules::window

use std::time::Duration;

use futures::future::{self, Pending, Ready};
use futures_timer::Delay;

/// Collect keys for `duration` after the first key arrives. This is the
/// usual choice for a server: every lookup made while resolving one pass of
/// a request lands in the same batch.
pub fn after(duration: Duration) -> impl Fn() -> Delay + Clone {
    move || Delay::new(duration)
}

/// Dispatch as soon as any future of the batch is polled. Only keys loaded
/// before that first poll are batched together.
pub fn immediate() -> Ready<()> {
    future::ready(())
}

/// Never dispatch on a timer. The batch is dispatched by
/// [`BatchController::flush`] or by reaching `max_keys`.
///
/// [`BatchController::flush`]: crate::BatchController::flush
pub fn manual() -> Pending<()> {
    future::pending()
}
