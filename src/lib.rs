#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod composer;
pub mod config;
mod controller;
mod credentials;
pub mod error;
pub mod hydrate;
mod leader;
pub mod metrics;
mod resource;
pub mod server;
pub mod state_sync;
pub mod telemetry;

pub use client::build as build_client;
pub use controller::run;
pub use leader::{acquire as acquire_leader_lease, hold as hold_leader_lease};
pub use resource::{
    InputRepo, Phase, Session, SessionCondition, SessionIdentity, SessionSpec, SessionStatus,
    WorkflowRef,
};
