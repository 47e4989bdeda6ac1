//! # Gridwell DLM - Dynamic Load Management for EV charging fleets
//!
//! A control plane that arbitrates shared electrical capacity across many
//! charging stations: a capability-aware allocator, phase-current and
//! DC fast-charge controllers, site constraints enforcement, hysteretic
//! load shedding, and fail-safe takeover on communication loss.
//!
//! ## Architecture
//!
//! - `types`: shared data model (stations, meters, capabilities, violations)
//! - `state`: the single-writer Event Bus & State Store
//! - `capability`: per-station capability envelopes and command validation
//! - `breaker`: circuit breaker and watchdog primitives used by drivers
//! - `driver`: Modbus/MQTT/OCPP station adapters behind one contract
//! - `control`: AC phase-current and DC fast-charge setpoint controllers
//! - `constraints`: site electrical envelope (service/feeder/transformer)
//! - `shedding`: hysteretic load shedding controller
//! - `allocator`: the periodic capacity-balancing loop
//! - `failsafe`: per-station and system-wide fail-safe supervision
//! - `persistence`: durable JSON snapshot of registered state
//! - `session`: per-station charging session tracking
//! - `config`: YAML-based configuration with validation and env overrides
//! - `logging`: structured logging and tracing
//! - `web`: REST API and WebSocket push channel

pub mod allocator;
pub mod breaker;
pub mod capability;
pub mod config;
pub mod constraints;
pub mod control;
pub mod driver;
pub mod error;
pub mod failsafe;
pub mod logging;
pub mod persistence;
pub mod session;
pub mod shedding;
pub mod state;
pub mod types;
pub mod web;

pub use config::Config;
pub use error::{DlmError, Result};
