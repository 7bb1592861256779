//! RemoteRL client.
//!
//! Connects a trainer or a simulator to the relay. A trainer gets a
//! [`RemoteEnvironment`] per paired slot; a simulator runs a [`SimulatorHost`]
//! that answers calls with its own environments.

pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod hooks;

pub use client::{ClientOptions, RelayClient, RelayEvent, RelaySender};
pub use config::{resolve_api_key, LocalConfig};
pub use env::{Environment, EnvironmentFactory, RemoteEnvironment, SimulatorHost};
pub use error::{ClientError, Result};
pub use hooks::{BackendHooks, HookRegistry, NoopHooks};
