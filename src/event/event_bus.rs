//! # Event Bus Implementation
//!
//! The EventBus is the publish-subscribe collaborator a [`Drain`](super::drain::Drain)
//! talks to. Events are addressed by name and carry an optional payload.
//!
//! ## Features
//!
//! - **Named Events**: Handlers subscribe to a single event name
//! - **Synchronous Dispatch**: `emit` runs every handler before it returns
//! - **Error Propagation**: A failing handler stops dispatch and its error is
//!   returned from `emit`
//!
//! ## Design Decisions
//!
//! Handlers are stored as `Arc` trait objects so that the exact handler which was
//! subscribed can later be removed again by identity. `emit` clones the handler
//! list before dispatching, which lets handlers re-enter the bus (emit a response
//! from inside a request handler, or unsubscribe themselves) without deadlocking.

use std::{collections::HashMap, fmt, sync::Arc};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Callback invoked for every emitted event it is subscribed to.
pub type Handler<P> = Arc<dyn Fn(Option<&P>) -> EventResult<()> + Send + Sync>;

/// # EventBus
///
/// Publish-subscribe contract used by the drain.
///
/// Implementations must dispatch synchronously: when `emit` returns, every handler
/// subscribed to the event at the time of the call has run (or one has failed).
pub trait EventBus<P>: Send + Sync {
    /// Dispatches `payload` to all handlers of `event_name`.
    ///
    /// # Errors
    ///
    /// Returns the first handler error. Handlers after the failing one are not called.
    fn emit(&self, event_name: &str, payload: Option<P>) -> EventResult<()>;

    /// Registers `handler` for `event_name`.
    fn subscribe(&self, event_name: &str, handler: Handler<P>);

    /// Removes a previously registered handler. Unknown handlers are ignored.
    fn unsubscribe(&self, event_name: &str, handler: &Handler<P>);

    /// Number of handlers currently registered for `event_name`.
    fn subscriber_count(&self, event_name: &str) -> usize;
}

/// In-process bus with synchronous dispatch.
///
/// ```rust
/// use std::sync::Arc;
/// use event_drain::event_bus::{EventBus, Handler, InMemoryEventBus, Value};
///
/// let bus = InMemoryEventBus::<Value>::new();
/// let handler: Handler<Value> = Arc::new(|payload: Option<&Value>| {
///     println!("got {:?}", payload);
///     Ok(())
/// });
/// bus.subscribe("ping", handler.clone());
/// bus.emit("ping", Some(Value::from("hello"))).unwrap();
/// bus.unsubscribe("ping", &handler);
/// assert_eq!(bus.subscriber_count("ping"), 0);
/// ```
pub struct InMemoryEventBus<P> {
    handlers: DashMap<String, Vec<Handler<P>>>,
}

impl<P> InMemoryEventBus<P> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Names of all events that currently have at least one handler.
    fn event_names(&self) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl<P> Default for InMemoryEventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for InMemoryEventBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("events", &self.event_names())
            .finish()
    }
}

impl<P> EventBus<P> for InMemoryEventBus<P> {
    fn emit(&self, event_name: &str, payload: Option<P>) -> EventResult<()> {
        // snapshot so that no shard lock is held while handlers run
        let handlers = self
            .handlers
            .get(event_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        if handlers.is_empty() {
            trace!("Emitting {} with no subscribers", event_name);
            return Ok(());
        }
        debug!("Emitting {} to {} subscriber(s)", event_name, handlers.len());

        for handler in handlers {
            handler(payload.as_ref())?;
        }
        Ok(())
    }

    fn subscribe(&self, event_name: &str, handler: Handler<P>) {
        trace!("Subscribing handler to {}", event_name);
        self.handlers
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
    }

    fn unsubscribe(&self, event_name: &str, handler: &Handler<P>) {
        if let Some(mut entry) = self.handlers.get_mut(event_name) {
            let before = entry.len();
            entry.retain(|registered| !Arc::ptr_eq(registered, handler));
            if entry.len() != before {
                trace!("Unsubscribed handler from {}", event_name);
            }
        }
    }

    fn subscriber_count(&self, event_name: &str) -> usize {
        self.handlers
            .get(event_name)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}

// 値の型
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    Null,
}

impl<T: Into<String>> From<T> for Value
where
    T: AsRef<str>,
{
    fn from(value: T) -> Self {
        Value::String(value.into())
    }
}

impl Value {
    /// Converts a decoded JSON document, e.g. a `{"done": .., "value": ..}` wire payload.
    ///
    /// Numbers that fit in `i64` become `Integer`. Anything else, including unsigned
    /// values above `i64::MAX`, becomes a `Float` and may lose precision.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect::<HashMap<String, Value>>(),
            ),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Event handler failed on {event_name}: {message}")]
    HandlerFailed { event_name: String, message: String },
}

pub type EventResult<T> = Result<T, EventError>;
