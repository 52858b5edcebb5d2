//! Measurement history and the metering scheduler

pub mod history;
pub mod metering;
