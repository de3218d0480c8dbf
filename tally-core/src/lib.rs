//! # tally-core
//!
//! Core library for tally - a device-resident event tracking client.
//!
//! This library provides:
//! - Identity, super properties and event timers
//! - A bounded, persistent event queue
//! - Batched delivery with retry and backoff
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Each [`Tally`] client runs a worker that owns all mutable state:
//! - **Tracking:** calls are enriched with context, timers and super
//!   properties, then appended to the [`queue::EventQueue`]
//! - **Delivery:** the [`delivery::DeliveryEngine`] sends the oldest batch
//!   through a [`Transport`]; failed batches go back to the head of the queue
//! - **Persistence:** snapshots of identity, timers and queue are written
//!   through a [`persistence::DurableStore`] and restored on start
//!
//! ## Example
//!
//! ```rust,no_run
//! use tally_core::{ClientOptions, Config, Tally};
//!
//! let config = Config::load().expect("failed to load config");
//! let options = ClientOptions::from_config(&config.client).expect("invalid client config");
//! let tally = Tally::builder(options).build().expect("failed to start client");
//!
//! tally.track("App Opened");
//! tally.flush();
//! ```

// Re-export commonly used items at the crate root
pub use client::{ClientOptions, ClientRegistry, FlushReport, Settings, Tally, TallyBuilder};
pub use config::Config;
pub use error::{Error, Result};
pub use scheduler::{FlushDelegate, LifecycleEvent};
pub use transport::{AckInfo, ActivityIndicator, HttpTransport, Transport, TransportError};
pub use types::*;

// Public modules
pub mod client;
pub mod config;
pub mod delivery;
pub mod enrich;
pub mod error;
pub mod identity;
pub mod logging;
pub mod persistence;
pub mod push;
pub mod queue;
pub mod scheduler;
pub mod timer;
pub mod transport;
pub mod types;
