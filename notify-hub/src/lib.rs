//! notify-hub library crate.
//!
//! An asynchronous notification dispatch engine. Messages are delivered to
//! pluggable [`Platform`]s through a bounded queue and a worker pool, with
//! per-platform retry policies, circuit breakers and outcome callbacks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use notify_hub::{Dispatcher, HubConfig, Message, Target};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(platform: Arc<dyn notify_hub::Platform>) -> anyhow::Result<()> {
//! let dispatcher = Dispatcher::new(HubConfig::default())?;
//! dispatcher.register_platform(platform);
//! dispatcher.start();
//!
//! let message = Message::builder()
//!     .title("Deploy finished")
//!     .body("v1.4.2 is live")
//!     .target(Target::channel("chat", "#ops"))
//!     .build()?;
//!
//! let handle = dispatcher.send_async(message, &CancellationToken::new()).await?;
//! let report = handle.wait().await;
//! println!("{:?}", report.status);
//!
//! dispatcher.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod panic_hook;
pub mod platform;
pub mod queue;
pub mod retry;
pub mod taxonomy;

pub use callback::{Callback, CallbackEvent, CallbackExecutor, CallbackKind, CallbackRegistry};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use config::HubConfig;
pub use dispatcher::{AsyncHandle, DispatchReport, DispatchStatus, Dispatcher};
pub use domain::{Message, PlatformReceipt, SendResult, Target, TargetState};
pub use error::{Error, Result};
pub use metrics::HubSnapshot;
pub use platform::Platform;
pub use queue::OverflowPolicy;
pub use retry::{BackoffStrategy, JitterType, RetryPolicy};
pub use taxonomy::{BatchClassification, ErrorCode, NotifyError};
