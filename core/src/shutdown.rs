//! Graceful-shutdown controller shared by every long-running task.
//!
//! A [`Controller`] replaces the usual interrupt flag + join choreography:
//! triggering it resolves every [`Signal`] and cancels every future wrapped
//! with [`Controller::with_cancel`], while outstanding [`DelayToken`]s keep
//! [`Controller::completed_shutdown`] pending until cleanup work is done.
//!
//! The controller is cheap to clone and thread-safe. Note that dropping a
//! `JoinHandle` detaches the task instead of stopping it, so futures should
//! be wrapped *before* they are spawned.

use std::{
	future::Future,
	mem,
	pin::Pin,
	sync::{Arc, Mutex},
	task::{Context, Poll, Waker},
};

#[derive(Clone)]
pub struct Controller<T: Clone> {
	inner: Arc<Mutex<Inner<T>>>,
}

struct Inner<T> {
	/// Why the shutdown is happening; `None` until triggered.
	reason: Option<T>,
	/// Number of live delay tokens. Must reach 0 before completion.
	delay_tokens: usize,
	on_trigger: Vec<Waker>,
	on_complete: Vec<Waker>,
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Controller {
			inner: Arc::new(Mutex::new(Inner {
				reason: None,
				delay_tokens: 0,
				on_trigger: Vec::new(),
				on_complete: Vec::new(),
			})),
		}
	}

	pub fn is_shutdown_triggered(&self) -> bool {
		self.inner.lock().unwrap().reason.is_some()
	}

	pub fn is_shutdown_completed(&self) -> bool {
		let inner = self.inner.lock().unwrap();
		inner.reason.is_some() && inner.delay_tokens == 0
	}

	pub fn shutdown_reason(&self) -> Option<T> {
		self.inner.lock().unwrap().reason.clone()
	}

	/// Starts the shutdown. Fails if one has already been started; the
	/// original reason wins.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		let mut inner = self.inner.lock().unwrap();
		match &inner.reason {
			Some(original) => Err(ShutdownHasStarted {
				reason: original.clone(),
				ignored: reason,
			}),
			None => {
				inner.reason = Some(reason);
				for waker in mem::take(&mut inner.on_trigger) {
					waker.wake();
				}
				if inner.delay_tokens == 0 {
					for waker in mem::take(&mut inner.on_complete) {
						waker.wake();
					}
				}
				Ok(())
			},
		}
	}

	/// Future that resolves with the reason once the shutdown is triggered.
	pub fn triggered_shutdown(&self) -> Signal<T> {
		Signal {
			inner: self.inner.clone(),
		}
	}

	/// Future that resolves once the shutdown is triggered *and* every
	/// delay token has been dropped.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Wraps a future so a triggered shutdown cancels it. Completes with
	/// `Ok(value)` if the future wins the race, `Err(reason)` otherwise.
	pub fn with_cancel<F: Future>(&self, future: F) -> WithCancel<T, F> {
		WithCancel {
			signal: self.triggered_shutdown(),
			future: Ok(future),
		}
	}

	/// A token that keeps the shutdown from completing while it exists.
	/// Fails when the shutdown has already completed.
	pub fn delay_token(&self) -> Result<DelayToken<T>, ShutdownHasCompleted<T>> {
		let mut inner = self.inner.lock().unwrap();
		if inner.delay_tokens == 0 {
			if let Some(reason) = &inner.reason {
				return Err(ShutdownHasCompleted {
					reason: reason.clone(),
				});
			}
		}
		inner.delay_tokens += 1;
		Ok(DelayToken {
			inner: self.inner.clone(),
		})
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl Controller<String> {
	/// Triggers the shutdown with `reason` when the process receives one of
	/// the usual termination signals (Ctrl-C / SIGTERM).
	pub async fn on_user_signal(self, reason: String) {
		let ctrl_c = tokio::signal::ctrl_c();
		#[cfg(unix)]
		{
			let term = async {
				let mut sig =
					tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
				sig.recv().await;
				std::io::Result::Ok(())
			};
			tokio::select! {
				_ = ctrl_c => {},
				_ = term => {},
			}
		}
		#[cfg(not(unix))]
		{
			_ = ctrl_c.await;
		}
		let _ = self.trigger_shutdown(reason);
	}
}

/// Resolves with the shutdown reason once a shutdown is triggered.
#[must_use = "futures stay idle unless you await them"]
pub struct Signal<T: Clone> {
	inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone> Future for Signal<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().unwrap();
		if let Some(reason) = &inner.reason {
			return Poll::Ready(reason.clone());
		}
		// always store a fresh waker so we never wake a stale task
		inner.on_trigger.push(cx.waker().clone());
		Poll::Pending
	}
}

/// Resolves once all delay tokens are gone and a reason exists.
#[must_use = "futures stay idle unless you await them"]
pub struct Completed<T: Clone> {
	inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone> Future for Completed<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().unwrap();
		if let (0, Some(reason)) = (inner.delay_tokens, inner.reason.as_ref()) {
			return Poll::Ready(reason.clone());
		}
		inner.on_complete.push(cx.waker().clone());
		Poll::Pending
	}
}

/// See [`Controller::with_cancel`].
#[must_use = "futures stay idle unless you await them"]
pub struct WithCancel<T: Clone, F> {
	signal: Signal<T>,
	future: Result<F, T>,
}

impl<T: Clone, F: Future> Future for WithCancel<T, F> {
	type Output = Result<F::Output, T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		// Stack pinning: the wrapped future is never moved out of `this`,
		// so the `F: !Unpin` requirements hold.
		let this = unsafe { self.get_unchecked_mut() };
		match &mut this.future {
			Err(reason) => Poll::Ready(Err(reason.clone())),
			Ok(future) => {
				let future = unsafe { Pin::new_unchecked(future) };
				match future.poll(cx) {
					Poll::Ready(value) => Poll::Ready(Ok(value)),
					Poll::Pending => {
						if let Poll::Ready(reason) = Pin::new(&mut this.signal).poll(cx) {
							this.future = Err(reason.clone());
							return Poll::Ready(Err(reason));
						}
						Poll::Pending
					},
				}
			},
		}
	}
}

/// The shutdown is delayed for as long as this token (or any clone) exists.
pub struct DelayToken<T: Clone> {
	inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone> std::fmt::Debug for DelayToken<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DelayToken").finish()
	}
}

impl<T: Clone> Clone for DelayToken<T> {
	fn clone(&self) -> Self {
		self.inner.lock().unwrap().delay_tokens += 1;
		DelayToken {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Drop for DelayToken<T> {
	fn drop(&mut self) {
		let mut inner = self.inner.lock().unwrap();
		inner.delay_tokens = inner.delay_tokens.saturating_sub(1);
		if inner.delay_tokens == 0 && inner.reason.is_some() {
			for waker in mem::take(&mut inner.on_complete) {
				waker.wake();
			}
		}
	}
}

/// Returned when a shutdown is triggered twice.
#[derive(Debug, Clone)]
pub struct ShutdownHasStarted<T> {
	pub reason: T,
	pub ignored: T,
}

impl<T: std::fmt::Debug> std::error::Error for ShutdownHasStarted<T> {}

impl<T> std::fmt::Display for ShutdownHasStarted<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "shutdown has already commenced")
	}
}

/// Returned when asking for a delay token after completion.
#[derive(Debug)]
pub struct ShutdownHasCompleted<T> {
	pub reason: T,
}

impl<T: std::fmt::Debug> std::error::Error for ShutdownHasCompleted<T> {}

impl<T> std::fmt::Display for ShutdownHasCompleted<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "shutdown has already completed")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{future, time::Duration};
	use tokio::{
		runtime,
		time::{sleep, timeout},
	};

	// a plain runtime with an outer timeout keeps a broken controller from
	// hanging the whole test suite
	#[track_caller]
	fn test_runtime(test: impl Future<Output = ()>) {
		let runtime = runtime::Runtime::new().unwrap();
		runtime.block_on(async move {
			assert!(timeout(Duration::from_millis(200), test).await.is_ok());
		});
	}

	#[test]
	fn trigger_resolves_signal_and_completion() {
		test_runtime(async {
			let controller = Controller::new();
			assert!(controller.trigger_shutdown(1).is_ok());
			assert_eq!(controller.triggered_shutdown().await, 1);
			assert_eq!(controller.completed_shutdown().await, 1);
		});
	}

	#[test]
	fn second_trigger_is_rejected() {
		let controller = Controller::new();
		assert!(controller.trigger_shutdown("first").is_ok());
		let err = controller.trigger_shutdown("second").unwrap_err();
		assert_eq!(err.reason, "first");
		assert_eq!(err.ignored, "second");
	}

	#[test]
	fn delay_token_postpones_completion() {
		test_runtime(async {
			let controller = Controller::new();
			let token = controller.delay_token().unwrap();
			assert!(controller.trigger_shutdown(7).is_ok());
			controller.triggered_shutdown().await;
			assert!(!controller.is_shutdown_completed());

			tokio::spawn(async move {
				sleep(Duration::from_millis(10)).await;
				drop(token);
			});
			assert_eq!(controller.completed_shutdown().await, 7);
		});
	}

	#[test]
	fn with_cancel_yields_reason_on_shutdown() {
		test_runtime(async {
			let controller = Controller::new();
			let task = tokio::spawn(controller.with_cancel(future::pending::<()>()));
			assert!(controller.trigger_shutdown("stop").is_ok());
			assert_eq!(task.await.unwrap().unwrap_err(), "stop");
		});
	}

	#[test]
	fn with_cancel_passes_through_completed_value() {
		test_runtime(async {
			let controller = Controller::<()>::new();
			let value = controller.with_cancel(future::ready(42)).await;
			assert_eq!(value, Ok(42));
		});
	}

	#[test]
	fn delay_token_after_completion_fails() {
		let controller = Controller::new();
		assert!(controller.trigger_shutdown("done").is_ok());
		let err = controller.delay_token().unwrap_err();
		assert_eq!(err.reason, "done");
	}
}
