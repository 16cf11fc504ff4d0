// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Guarded execution of user callbacks.
//!
//! Every user-authored callback (test function, fixture hook, precondition
//! hook) runs on a fresh worker thread through [`safe_call`], which enforces
//! a context timeout, waits out a grace period for the callback to notice
//! the timeout and return, recovers panics, and abandons workers that
//! refuse to die. The planner blocks on the safe call, so at most one user
//! callback is ever live.

use crate::{errors::SafeCallError, Context};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::debug;

/// Grace period used when a caller does not have a better value.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Marker payload for the clean unwind performed by `State::fatal`.
///
/// A callback unwinding with this payload has terminated deliberately after
/// recording its error; the safe-call boundary treats it as a normal return
/// and does not invoke the panic handler.
pub(crate) struct FatalUnwind;

/// Runs `f` on a fresh worker thread with a derived context whose deadline
/// is `timeout` from now.
///
/// Returns an error in exactly two cases:
///
/// - `ctx` is cancelled before `f` returns: the cancellation cause.
/// - `f` has not returned `timeout + grace` after start: a
///   [`SafeCallError::DidNotReturn`]; the worker is abandoned forever and a
///   later panic from it will not reach `on_panic`.
///
/// Otherwise returns `Ok(())`, whether `f` returned normally or panicked.
/// On a panic, `on_panic` runs synchronously on the worker before the
/// worker reports completion, so `safe_call` never returns while
/// `on_panic` is still executing.
pub async fn safe_call<F, P>(
    ctx: &Context,
    name: &str,
    timeout: Duration,
    grace: Duration,
    on_panic: P,
    f: F,
) -> Result<(), SafeCallError>
where
    F: FnOnce(&Context) + Send + 'static,
    P: FnOnce(String) + Send + 'static,
{
    let child = ctx.with_timeout(timeout);
    let worker_ctx = child.clone();

    // The claim token: exactly one of {the waiter, the worker's panic path}
    // takes it. The waiter claims it to abandon the worker; the worker
    // claims it to run `on_panic`.
    let token = Arc::new(AtomicBool::new(false));
    let worker_token = Arc::clone(&token);

    let (done_tx, mut done_rx) = oneshot::channel::<()>();

    std::thread::Builder::new()
        .name(format!("dutest-call-{name}"))
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(&worker_ctx)));
            if let Err(payload) = result {
                if payload.downcast_ref::<FatalUnwind>().is_none()
                    && !worker_token.swap(true, Ordering::AcqRel)
                {
                    on_panic(panic_message(payload.as_ref()));
                }
            }
            let _ = done_tx.send(());
        })
        .expect("spawning a safe-call worker thread should not fail");

    let start = tokio::time::Instant::now();

    // Until the timeout: wait for the worker, then cancel the callback's
    // context so cooperative callbacks return during the grace period.
    tokio::select! {
        _ = &mut done_rx => return Ok(()),
        _ = ctx.cancelled() => return wait_out_cancellation(ctx, name, &token, done_rx).await,
        _ = tokio::time::sleep_until(start + timeout) => {
            debug!(name, ?timeout, "callback timeout reached, entering grace period");
            child.cancel(format!("{name}: timeout reached"));
        }
    }

    tokio::select! {
        _ = &mut done_rx => Ok(()),
        _ = ctx.cancelled() => wait_out_cancellation(ctx, name, &token, done_rx).await,
        _ = tokio::time::sleep_until(start + timeout + grace) => {
            // The worker may have finished in the instant the timer fired.
            match done_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => Ok(()),
                Err(oneshot::error::TryRecvError::Empty) => {
                    if token.swap(true, Ordering::AcqRel) {
                        // The worker won the race and is inside `on_panic`;
                        // block until it reports completion.
                        let _ = done_rx.await;
                        Ok(())
                    } else {
                        debug!(name, "abandoning worker after grace period");
                        Err(SafeCallError::DidNotReturn {
                            name: name.to_owned(),
                        })
                    }
                }
            }
        }
    }
}

/// The caller's context was cancelled. Claim the token so the abandoned
/// worker cannot fire `on_panic` during caller cleanup; if the worker beat
/// us to the token it is already inside `on_panic`, so block until it
/// finishes.
async fn wait_out_cancellation(
    ctx: &Context,
    name: &str,
    token: &AtomicBool,
    done_rx: oneshot::Receiver<()>,
) -> Result<(), SafeCallError> {
    if token.swap(true, Ordering::AcqRel) {
        let _ = done_rx.await;
    } else {
        debug!(name, "abandoning worker after cancellation");
    }
    Err(SafeCallError::Cancelled {
        cause: ctx
            .cause()
            .unwrap_or_else(|| "context cancelled".to_owned()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Mutex};

    fn panic_slot() -> (Arc<Mutex<Vec<String>>>, impl FnOnce(String) + Send) {
        let slot = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::clone(&slot);
        (slot, move |message: String| {
            writer.lock().unwrap().push(message);
        })
    }

    #[tokio::test]
    async fn quick_function_returns_ok() {
        let ctx = Context::new();
        let (slot, on_panic) = panic_slot();
        let result = safe_call(
            &ctx,
            "quick",
            Duration::from_secs(5),
            Duration::from_secs(5),
            on_panic,
            |_ctx| {},
        )
        .await;
        assert_eq!(result, Ok(()));
        assert!(slot.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panic_reaches_handler_before_return() {
        let ctx = Context::new();
        let (slot, on_panic) = panic_slot();
        let result = safe_call(
            &ctx,
            "panics",
            Duration::from_secs(5),
            Duration::from_secs(5),
            on_panic,
            |_ctx| panic!("boom"),
        )
        .await;
        assert_eq!(result, Ok(()));
        // `safe_call` must not return while on_panic is still pending.
        assert_eq!(slot.lock().unwrap().as_slice(), ["boom".to_owned()]);
    }

    #[tokio::test]
    async fn fatal_unwind_is_a_normal_return() {
        let ctx = Context::new();
        let (slot, on_panic) = panic_slot();
        let result = safe_call(
            &ctx,
            "fatal",
            Duration::from_secs(5),
            Duration::from_secs(5),
            on_panic,
            |_ctx| panic::resume_unwind(Box::new(FatalUnwind)),
        )
        .await;
        assert_eq!(result, Ok(()));
        assert!(slot.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hung_worker_is_abandoned_and_its_panic_suppressed() {
        let ctx = Context::new();
        let (slot, on_panic) = panic_slot();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let result = safe_call(
            &ctx,
            "hung",
            Duration::from_millis(20),
            Duration::from_millis(20),
            on_panic,
            move |_ctx| {
                // Block past timeout + grace, then panic.
                let _ = release_rx.recv();
                panic!("late panic");
            },
        )
        .await;
        assert_eq!(
            result,
            Err(SafeCallError::DidNotReturn {
                name: "hung".to_owned()
            })
        );
        assert_eq!(result.unwrap_err().to_string(), "hung did not return on timeout");

        // Release the abandoned worker; its panic must not reach on_panic.
        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(slot.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cooperative_callback_returns_within_grace() {
        let ctx = Context::new();
        let (slot, on_panic) = panic_slot();
        let start = std::time::Instant::now();
        let result = safe_call(
            &ctx,
            "cooperative",
            Duration::from_millis(20),
            Duration::from_secs(30),
            on_panic,
            |call_ctx| {
                // Spin until the derived context is cancelled at the
                // timeout, then return cleanly.
                while !call_ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            },
        )
        .await;
        assert_eq!(result, Ok(()));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(slot.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn parent_cancellation_returns_cause() {
        let ctx = Context::new();
        let cancel_ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_ctx.cancel("run aborted");
        });

        let (_slot, on_panic) = panic_slot();
        let (_keep_alive_tx, block_rx) = mpsc::channel::<()>();
        let result = safe_call(
            &ctx,
            "blocked",
            Duration::from_secs(30),
            Duration::from_secs(30),
            on_panic,
            move |_ctx| {
                let _ = block_rx.recv();
            },
        )
        .await;
        assert_eq!(
            result,
            Err(SafeCallError::Cancelled {
                cause: "run aborted".to_owned()
            })
        );
    }
}
