mod bridge;
mod client;
mod config;
mod coordinator;
mod diff;
mod dispatcher;
pub mod entity;
mod error;
mod logger;
mod normalize;
mod protocol;
mod session;
mod types;

pub use bridge::{Bridge, BridgeBuilder};
pub use client::{CloudClient, CloudClientBuilder};
pub use config::Config;
pub use coordinator::{
    Backoff, Coordinator, CoordinatorBuilder, CoordinatorStatus, DeviceSnapshot, PollOutcome,
    PollState, Snapshot,
};
pub use dispatcher::Dispatcher;
pub use entity::{
    ControlEntity, EntitySet, HvacMode, SelectEntity, SelectKind, SensorEntity, SensorKind,
    SensorValue,
};
pub use error::{ApiError, Error, NormalizationError, Result, ValidationError};
pub use logger::MessageLogMode;
pub use normalize::{
    Command, MAX_TARGET_CELSIUS, MIN_TARGET_CELSIUS, command_patch, normalize_state,
    quantize_humidifier,
};
pub use session::SessionStatus;
pub use types::*;
