pub mod clock;
pub mod dispatcher;
pub mod http_dispatcher;
pub mod lease;
pub mod repository;
pub mod retry;
pub mod signals;
pub mod sink;
pub mod worker;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

// Re-export key types
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DeliveryResponse, DispatchOutcome, EventDispatcher, SkipReason, WebhookSender};
pub use http_dispatcher::{HttpWebhookClient, HttpWebhookConfig};
pub use lease::LeaseManager;
pub use repository::EventRepository;
pub use retry::RetryPolicy;
pub use signals::{listen_for_interrupts, DeferGuard, InterruptAction, InterruptGate};
pub use worker::{CycleReport, Worker, WorkerSettings};
