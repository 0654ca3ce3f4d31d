//! # evlog server
//!
//! Segment server of the evlog event store.
//!
//! This crate provides:
//! - [`SegmentServer`]: block lifecycle, replica groups, appends and
//!   long-polling reads
//! - the TCP wire [`protocol`] and its [`SegmentClient`]
//! - the [`ControllerClient`] contract with a TCP implementation
//! - heartbeat, leader and block-full reporting to the controller
//!
//! # Lifecycle
//!
//! ```rust,ignore
//! use evlog_server::{RemoteController, SegmentServer, ServerConfig};
//! use std::sync::Arc;
//!
//! let config = ServerConfig::load(path)?.with_env();
//! let controller = Arc::new(RemoteController::new(config.controller_addresses.clone()));
//! let server = Arc::new(SegmentServer::new(config, controller)?);
//! server.initialize().await?;
//! server.start().await?;
//! server.serve(listener).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod controller;
mod error;
mod heartbeat;
mod metrics;
mod polling;
pub mod protocol;
mod rpc;
mod server;

pub use config::{ServerConfig, VolumeConfig, DEBUG_MODE_ENV};
pub use controller::{
    ControllerClient, ControllerRequest, ControllerResponse, HeartbeatRequest, LeaderReport,
    RegisterResponse, RemoteController, ReplicaInfo, SegmentInfo,
};
pub use error::{ErrorKind, ServerError, ServerResult, WireError};
pub use metrics::{BlockMetrics, BlockTraffic};
pub use polling::{PollingManager, Waiter};
pub use rpc::SegmentClient;
pub use server::{SegmentServer, ServerState};
