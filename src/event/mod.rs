//! # Event-Driven Pulls
//!
//! The event subsystem adapts a request/response protocol on a publish-subscribe bus
//! into a pull-based sequence.
//!
//! ## Architecture Overview
//!
//! - **EventBus**: Named-event publish/subscribe contract with synchronous dispatch,
//!   plus an in-memory implementation
//! - **DrainResponse**: Fallible view of a `{done, value}` response payload
//! - **Drain**: Emits one request per pull and settles the pull with the response
//!
//! ## Pull Flow
//!
//! ```text
//! Consumer ──next()──▶ Drain ──emit(request)──▶ EventBus ──▶ Responder
//!    ▲                   │                                       │
//!    │                   ◀──────handle_response◀──emit(response)─┘
//!    └──── Step{done, value}
//! ```
//!
//! 1. `next()` emits the request event unless a pull is already outstanding
//! 2. The responder answers by emitting the response event
//! 3. The drain settles the pull; a `done` response also disposes the drain
//!
//! ## Usage Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use event_drain::{config::DrainConfig, drain::Drain, event_bus::{EventBus, InMemoryEventBus, Value}};
//! # futures::executor::block_on(async {
//! let bus = Arc::new(InMemoryEventBus::<Value>::new());
//! let drain = Drain::new(bus.clone(), DrainConfig::new("lines:request", "lines:response"));
//!
//! drain.dispose();
//! let step = drain.next().await.unwrap();
//! assert!(step.done);
//! assert_eq!(bus.subscriber_count("lines:response"), 0);
//! # });
//! ```

pub mod drain;
pub mod event_bus;
pub mod response;
