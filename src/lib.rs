//! # event-drain: Pull-Based Sequences over Request/Response Events
//!
//! `event-drain` turns a request/response event protocol into an asynchronous
//! sequence. A consumer asks for the next item; the crate emits a request event on
//! a shared bus and resolves the pull once the matching response event arrives.
//!
//! ## Building Blocks
//!
//! - Event bus contract and in-memory bus ([`event_bus`])
//! - Response payloads and pulled steps ([`response`])
//! - The drain itself ([`drain`])
//! - Configuration loading ([`config`])
//! - Error handling ([`error`])
//!
//! ## Guarantees
//!
//! - At most one request is in flight per drain
//! - A response arriving with no outstanding request is a protocol violation and is
//!   reported to whoever dispatched it
//! - A response that cannot be read fails only the pull that was waiting for it
//! - Once a response reports `done`, no further requests are emitted

pub mod config;
pub mod error;
pub mod event;

// Re-exports
pub use error::*;
pub use event::*;

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        // テストの前に一度だけ実行したい処理
        // tracing_subscriberの初期化
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
