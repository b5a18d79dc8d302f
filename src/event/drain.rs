//! # Drain
//!
//! Turns a request/response pair of events into a pull-based sequence.
//!
//! Every call to [`Drain::next`] emits the request event (without payload) and waits
//! until the bus delivers the matching response event carrying `{done, value}`.
//! At most one request is in flight: a pull issued while another one is still
//! waiting joins it instead of emitting again.
//!
//! ```text
//! ┌────────┐ next() ┌───────┐ request  ┌─────────┐
//! │Consumer│───────▶│ Drain │─────────▶│Responder│
//! └────────┘        └───▲───┘          └────┬────┘
//!                       │     response      │
//!                       └───────────────────┘
//! ```
//!
//! Once a response reports `done`, the drain disposes itself: it unsubscribes from the
//! response event and every later pull yields [`Step::terminal`] without touching the
//! bus.
//!
//! ## Implementation Details
//!
//! The pending pull is a Tokio oneshot channel. The sender stays in the drain state
//! until the response handler settles it, the receiver is wrapped in a
//! [`Shared`] future so that joined pulls observe the same settlement.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use futures::{
    future::{FutureExt, Shared},
    stream::{self, Stream},
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::{
    event_bus::{EventBus, EventError, Handler},
    response::{DrainResponse, Step},
};
use crate::config::DrainConfig;

type Settlement<T> = DrainResult<Step<T>>;
type PendingResult<T> = Shared<oneshot::Receiver<Settlement<T>>>;

/// The single outstanding pull.
struct Pending<T> {
    sender: oneshot::Sender<Settlement<T>>,
    result: PendingResult<T>,
}

struct DrainState<T> {
    done: bool,
    waiting_for_response: bool,
    pending: Option<Pending<T>>,
}

enum Pull<T> {
    Finished,
    Joined(PendingResult<T>),
    Issued(PendingResult<T>),
}

struct DrainInner<P, B>
where
    P: DrainResponse,
    B: EventBus<P>,
{
    id: Uuid,
    bus: Arc<B>,
    request_event_name: String,
    response_event_name: String,
    state: Mutex<DrainState<P::Item>>,
    /// The exact handler subscribed to the response event, kept for unsubscribing.
    handler: Handler<P>,
}

impl<P, B> DrainInner<P, B>
where
    P: DrainResponse,
    P::Item: Clone,
    B: EventBus<P>,
{
    fn state(&self) -> MutexGuard<'_, DrainState<P::Item>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_done(&self) -> bool {
        self.state().done
    }

    fn begin_pull(&self) -> Pull<P::Item> {
        let mut state = self.state();
        if state.done {
            return Pull::Finished;
        }
        if let Some(pending) = &state.pending {
            return Pull::Joined(pending.result.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let result = receiver.shared();
        state.pending = Some(Pending {
            sender,
            result: result.clone(),
        });
        state.waiting_for_response = true;
        Pull::Issued(result)
    }

    fn emit_request(&self) -> DrainResult<()> {
        trace!(drain = %self.id, "Emitting request {}", self.request_event_name);
        if let Err(e) = self.bus.emit(&self.request_event_name, None) {
            warn!(drain = %self.id, "Request {} failed: {}", self.request_event_name, e);
            let error = DrainError::from(e);
            // a pull nobody answered goes back to idle
            let unanswered = {
                let mut state = self.state();
                if state.waiting_for_response {
                    state.waiting_for_response = false;
                    state.pending.take()
                } else {
                    None
                }
            };
            if let Some(pending) = unanswered {
                let _ = pending.sender.send(Err(error.clone()));
            }
            return Err(error);
        }
        Ok(())
    }

    fn handle_response(&self, payload: Option<&P>) -> DrainResult<()> {
        let pending = {
            let mut state = self.state();
            if !state.waiting_for_response {
                drop(state);
                warn!(drain = %self.id, "Response without outstanding request on {}", self);
                return Err(DrainError::UnexpectedResponse {
                    drain: self.to_string(),
                });
            }
            state.waiting_for_response = false;
            state.pending.take()
        };

        let settlement = self.evaluate(payload);
        match &settlement {
            Ok(step) => trace!(drain = %self.id, done = step.done, "Resolving pull"),
            Err(e) => debug!(drain = %self.id, "Rejecting pull: {}", e),
        }
        if let Some(pending) = pending {
            let _ = pending.sender.send(settlement);
        }
        Ok(())
    }

    fn evaluate(&self, payload: Option<&P>) -> Settlement<P::Item> {
        let response = payload.ok_or_else(|| DrainError::MissingPayload {
            event_name: self.response_event_name.clone(),
        })?;
        let done = response.done()?;
        if done {
            self.dispose();
        }
        Ok(Step {
            done,
            value: response.value()?,
        })
    }

    fn dispose(&self) {
        let (first, pending) = {
            let mut state = self.state();
            let first = !state.done;
            state.done = true;
            state.waiting_for_response = false;
            (first, state.pending.take())
        };

        if let Some(pending) = pending {
            let _ = pending.sender.send(Err(DrainError::Disposed {
                drain: self.to_string(),
            }));
        }
        if first {
            self.bus
                .unsubscribe(&self.response_event_name, &self.handler);
            debug!(drain = %self.id, "Disposed {}", self);
        }
    }
}

impl<P, B> fmt::Display for DrainInner<P, B>
where
    P: DrainResponse,
    B: EventBus<P>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Drain(request: {}, response: {})",
            self.request_event_name, self.response_event_name
        )
    }
}

impl<P, B> Drop for DrainInner<P, B>
where
    P: DrainResponse,
    B: EventBus<P>,
{
    fn drop(&mut self) {
        let done = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .done;
        if !done {
            self.bus
                .unsubscribe(&self.response_event_name, &self.handler);
        }
    }
}

/// # Drain
///
/// Pull-based view over a request/response event pair.
///
/// `Drain` is a cheap handle; clones share one state machine and one subscription.
/// The subscription is removed on [`dispose`](Drain::dispose), when a response
/// reports `done`, or when the last handle is dropped.
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use event_drain::{
///     config::DrainConfig,
///     drain::Drain,
///     event_bus::{EventBus, InMemoryEventBus},
///     response::Step,
/// };
///
/// # futures::executor::block_on(async {
/// let bus = Arc::new(InMemoryEventBus::<Step<u32>>::new());
///
/// // responder counting down from 3
/// let weak = Arc::downgrade(&bus);
/// let remaining = std::sync::atomic::AtomicU32::new(3);
/// bus.subscribe(
///     "numbers:request",
///     Arc::new(move |_: Option<&Step<u32>>| {
///         let Some(bus) = weak.upgrade() else { return Ok(()) };
///         let response = match remaining.load(std::sync::atomic::Ordering::SeqCst) {
///             0 => Step::terminal(),
///             n => {
///                 remaining.store(n - 1, std::sync::atomic::Ordering::SeqCst);
///                 Step::item(n)
///             }
///         };
///         bus.emit("numbers:response", Some(response))
///     }),
/// );
///
/// let drain = Drain::new(
///     bus.clone(),
///     DrainConfig::new("numbers:request", "numbers:response"),
/// );
/// assert_eq!(drain.collect().await.unwrap(), vec![3, 2, 1]);
/// assert!(drain.is_done());
/// # });
/// ```
pub struct Drain<P, B>
where
    P: DrainResponse,
    B: EventBus<P>,
{
    inner: Arc<DrainInner<P, B>>,
}

impl<P, B> Drain<P, B>
where
    P: DrainResponse + 'static,
    P::Item: Clone + Send + Sync + 'static,
    B: EventBus<P> + 'static,
{
    /// Creates a drain and subscribes it to the response event.
    ///
    /// No request is emitted until the first [`next`](Drain::next).
    pub fn new(bus: Arc<B>, config: DrainConfig) -> Self {
        let DrainConfig {
            request_event_name,
            response_event_name,
        } = config;

        let inner = Arc::new_cyclic(|weak: &Weak<DrainInner<P, B>>| {
            let weak = weak.clone();
            let handler: Handler<P> = Arc::new(move |payload: Option<&P>| match weak.upgrade() {
                Some(inner) => {
                    inner
                        .handle_response(payload)
                        .map_err(|e| EventError::HandlerFailed {
                            event_name: inner.response_event_name.clone(),
                            message: e.to_string(),
                        })
                }
                None => Ok(()),
            });
            DrainInner {
                id: Uuid::new_v4(),
                bus,
                request_event_name,
                response_event_name,
                state: Mutex::new(DrainState {
                    done: false,
                    waiting_for_response: false,
                    pending: None,
                }),
                handler,
            }
        });

        inner
            .bus
            .subscribe(&inner.response_event_name, inner.handler.clone());
        debug!(drain = %inner.id, "Created {}", inner);

        Self { inner }
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn request_event_name(&self) -> &str {
        &self.inner.request_event_name
    }

    pub fn response_event_name(&self) -> &str {
        &self.inner.response_event_name
    }

    /// Pulls the next step of the sequence.
    ///
    /// - After the drain is done this is immediately ready with [`Step::terminal`].
    /// - While a pull is outstanding this joins it and yields the same settlement.
    /// - Otherwise the request event is emitted and the call waits for the response.
    ///
    /// # Errors
    ///
    /// * `DrainError::Response` / `DrainError::MissingPayload` - The response could not
    ///   be evaluated. Only this pull fails; the drain stays usable.
    /// * `DrainError::EventBus` - Emitting the request failed.
    /// * `DrainError::Disposed` - The drain was disposed while the pull was waiting.
    #[instrument(level = "trace", skip(self), fields(drain = %self.inner.id))]
    pub async fn next(&self) -> DrainResult<Step<P::Item>> {
        let result = match self.inner.begin_pull() {
            Pull::Finished => return Ok(Step::terminal()),
            Pull::Joined(result) => {
                trace!("Joining outstanding pull");
                result
            }
            Pull::Issued(result) => {
                self.inner.emit_request()?;
                result
            }
        };

        match result.await {
            Ok(settlement) => settlement,
            Err(_) => Err(DrainError::Disposed {
                drain: self.to_string(),
            }),
        }
    }

    /// Processes one response event. This is what the bus subscription calls.
    ///
    /// # Errors
    ///
    /// Returns `DrainError::UnexpectedResponse` when no pull is outstanding. Failures
    /// while reading the response are not returned here; they reject the pending pull.
    pub fn handle_response(&self, payload: Option<&P>) -> DrainResult<()> {
        self.inner.handle_response(payload)
    }

    /// Stops the drain and removes its response subscription.
    ///
    /// Safe to call repeatedly. A pull still waiting for its response fails with
    /// `DrainError::Disposed`.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Pulls until the sequence is done and returns the items in order.
    pub async fn collect(&self) -> DrainResult<Vec<P::Item>> {
        let mut items = Vec::new();
        loop {
            match self.next().await? {
                Step { done: true, .. } => return Ok(items),
                Step {
                    value: Some(value), ..
                } => items.push(value),
                Step { value: None, .. } => {
                    return Err(DrainError::MissingValue {
                        drain: self.to_string(),
                    })
                }
            }
        }
    }

    /// Exposes the drain as a stream of items.
    ///
    /// The stream ends with the sequence and stops after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = DrainResult<P::Item>> {
        stream::unfold(Some(self), |drain| async move {
            let drain = drain?;
            match drain.next().await {
                Ok(Step { done: true, .. }) => None,
                Ok(Step {
                    value: Some(value), ..
                }) => Some((Ok(value), Some(drain))),
                Ok(Step { value: None, .. }) => {
                    let error = DrainError::MissingValue {
                        drain: drain.to_string(),
                    };
                    Some((Err(error), None))
                }
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl<P, B> Clone for Drain<P, B>
where
    P: DrainResponse,
    B: EventBus<P>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, B> fmt::Display for Drain<P, B>
where
    P: DrainResponse,
    B: EventBus<P>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<P, B> fmt::Debug for Drain<P, B>
where
    P: DrainResponse,
    B: EventBus<P>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Drain")
            .field("id", &self.inner.id)
            .field("request_event_name", &self.inner.request_event_name)
            .field("response_event_name", &self.inner.response_event_name)
            .field("done", &state.done)
            .field("waiting_for_response", &state.waiting_for_response)
            .field("pending", &state.pending.is_some())
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DrainError {
    #[error("unexpected response: no pull outstanding on {drain}")]
    UnexpectedResponse { drain: String },
    #[error("Response evaluation failed: {message}")]
    Response { message: String },
    #[error("Response payload missing on {event_name}")]
    MissingPayload { event_name: String },
    #[error("Response without value before the sequence finished: {drain}")]
    MissingValue { drain: String },
    #[error("Drain disposed while a pull was pending: {drain}")]
    Disposed { drain: String },
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventError),
}

pub type DrainResult<T> = Result<T, DrainError>;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::{pin_mut, poll};

    use super::*;
    use crate::event::{event_bus::InMemoryEventBus, response::MockDrainResponse};

    const REQUEST: &str = "test:request";
    const RESPONSE: &str = "test:response";

    fn setup<P>() -> (Arc<InMemoryEventBus<P>>, Arc<AtomicUsize>)
    where
        P: 'static,
    {
        let bus = Arc::new(InMemoryEventBus::new());
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        bus.subscribe(
            REQUEST,
            Arc::new(move |_: Option<&P>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        (bus, requests)
    }

    fn config() -> DrainConfig {
        DrainConfig::new(REQUEST, RESPONSE)
    }

    #[tokio::test]
    async fn test_external_dispose_rejects_pending_pull() {
        let (bus, requests) = setup::<Step<String>>();
        let drain = Drain::new(bus.clone(), config());

        let pull = drain.next();
        pin_mut!(pull);
        assert!(poll!(pull.as_mut()).is_pending());
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        drain.dispose();

        assert!(matches!(pull.await, Err(DrainError::Disposed { .. })));
        assert!(drain.is_done());
        assert_eq!(bus.subscriber_count(RESPONSE), 0);
    }

    #[tokio::test]
    async fn test_missing_payload_rejects_only_that_pull() {
        let (bus, requests) = setup::<Step<String>>();
        let drain = Drain::new(bus.clone(), config());

        let pull = drain.next();
        pin_mut!(pull);
        assert!(poll!(pull.as_mut()).is_pending());
        bus.emit(RESPONSE, None).unwrap();

        assert_eq!(
            pull.await,
            Err(DrainError::MissingPayload {
                event_name: RESPONSE.to_string()
            })
        );
        assert!(!drain.is_done());

        // the drain is still usable
        let pull = drain.next();
        pin_mut!(pull);
        assert!(poll!(pull.as_mut()).is_pending());
        bus.emit(RESPONSE, Some(Step::item("a".to_string())))
            .unwrap();
        assert_eq!(pull.await.unwrap(), Step::item("a".to_string()));
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_value_failure_after_done_still_disposes() {
        let (bus, _) = setup::<MockDrainResponse>();
        let drain = Drain::new(bus.clone(), config());

        let mut response = MockDrainResponse::new();
        response.expect_done().times(1).returning(|| Ok(true));
        response.expect_value().times(1).returning(|| {
            Err(DrainError::Response {
                message: "value unavailable".to_string(),
            })
        });

        let pull = drain.next();
        pin_mut!(pull);
        assert!(poll!(pull.as_mut()).is_pending());
        bus.emit(RESPONSE, Some(response)).unwrap();

        assert_eq!(
            pull.await,
            Err(DrainError::Response {
                message: "value unavailable".to_string()
            })
        );
        assert!(drain.is_done());
        assert_eq!(bus.subscriber_count(RESPONSE), 0);
    }

    #[tokio::test]
    async fn test_failed_request_returns_to_idle() {
        let bus = Arc::new(InMemoryEventBus::<Step<String>>::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        bus.subscribe(
            REQUEST,
            Arc::new(move |_: Option<&Step<String>>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EventError::HandlerFailed {
                    event_name: REQUEST.to_string(),
                    message: "responder offline".to_string(),
                })
            }),
        );
        let drain = Drain::new(bus.clone(), config());

        let first = drain.next().await;
        assert!(matches!(first, Err(DrainError::EventBus(_))));

        // not stuck on the failed pull: a new request goes out
        let second = drain.next().await;
        assert!(matches!(second, Err(DrainError::EventBus(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!drain.is_done());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let (bus, _) = setup::<Step<String>>();
        let drain = Drain::new(bus.clone(), config());
        let other = drain.clone();
        assert_eq!(bus.subscriber_count(RESPONSE), 1);

        drop(drain);
        assert_eq!(bus.subscriber_count(RESPONSE), 1);

        drop(other);
        assert_eq!(bus.subscriber_count(RESPONSE), 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (bus, requests) = setup::<Step<String>>();
        let drain = Drain::new(bus.clone(), config());

        drain.dispose();
        drain.dispose();

        assert!(drain.is_done());
        assert_eq!(bus.subscriber_count(RESPONSE), 0);
        assert_eq!(drain.next().await, Ok(Step::terminal()));
        assert_eq!(requests.load(Ordering::SeqCst), 0);

        // nothing is outstanding once disposed
        let late = drain.handle_response(Some(&Step::item("late".to_string())));
        assert!(matches!(late, Err(DrainError::UnexpectedResponse { .. })));
    }

    #[tokio::test]
    async fn test_external_dispose_rejects_joined_pull() {
        let (bus, requests) = setup::<Step<String>>();
        let drain = Drain::new(bus.clone(), config());

        let first = drain.next();
        let joined = drain.next();
        pin_mut!(first);
        pin_mut!(joined);
        assert!(poll!(first.as_mut()).is_pending());
        assert!(poll!(joined.as_mut()).is_pending());
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        drain.dispose();

        let (first, joined) = futures::join!(first, joined);
        assert!(matches!(first, Err(DrainError::Disposed { .. })));
        assert!(matches!(joined, Err(DrainError::Disposed { .. })));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_reports_state() {
        let (bus, _) = setup::<Step<String>>();
        let drain = Drain::new(bus, config());
        let debug = format!("{:?}", drain);
        assert!(debug.contains("done: false"));
        assert!(debug.contains(REQUEST));
    }
}
