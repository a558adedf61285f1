//! # Dashboard Broadcast
//!
//! Everything on the dashboard side of the gateway.
//!
//! ## Core Components:
//!
//! - **`broadcaster`**: The subscriber set, the device registry and the ordered
//!   per-sample fan-out.
//! - **`filter`**: Per-subscriber sample filters.
//! - **`messages`**: Dashboard wire frames in both directions.
//! - **`session`**: The per-connection task relaying frames between one
//!   dashboard and the broadcaster.

/// Subscriber registry and fan-out.
pub mod broadcaster;
/// Subscription filters.
pub mod filter;
/// Dashboard wire frames.
pub mod messages;
/// Per-connection dashboard driver.
pub mod session;

pub use broadcaster::{BroadcastReport, BroadcasterConfig, RealtimeBroadcaster, SubscriberHandle};
pub use filter::SubscriptionFilter;
pub use messages::{DashboardControl, DashboardMessage};
pub use session::run_dashboard_session;
