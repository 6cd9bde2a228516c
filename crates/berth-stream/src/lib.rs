//! # berth-stream
//!
//! Client-side consumers for the long-lived streams a container daemon
//! pushes over HTTP.
//!
//! - [`Monitor`](monitor::Monitor) owns one lifecycle event connection and
//!   fans parsed [`Event`](event::Event)s out to
//!   [`Subscription`](subscription::Subscription)s.
//! - [`demux`] splits a multiplexed attach/logs body into stdout/stderr
//!   using the [`frame`] codec.
//! - [`stats`] decodes back-to-back JSON snapshots from a stats body.
//!
//! All of them reach the daemon through the [`StreamTransport`](transport::StreamTransport)
//! trait; [`HttpTransport`](transport::HttpTransport) is the blocking HTTP
//! implementation and [`StreamClient`](client::StreamClient) wires the
//! pieces together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use berth_common::config::MonitorConfig;
//! use berth_common::types::SubjectKey;
//! use berth_stream::monitor::Monitor;
//! use berth_stream::transport::HttpTransport;
//!
//! # fn main() -> berth_common::error::Result<()> {
//! let transport = Arc::new(HttpTransport::new("http://127.0.0.1:2375")?);
//! let monitor = Monitor::new(transport, MonitorConfig::default());
//! let subscription = monitor.subscribe(SubjectKey::All)?;
//! subscription.handle("start", |event| tracing::info!(id = %event.id, "started"));
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod demux;
pub mod event;
pub mod frame;
pub mod monitor;
pub mod stats;
pub mod subscription;
pub mod transport;
