//! Capture engine, submission sinks and configuration for the face-capture
//! kiosk daemon.

pub mod config;
pub mod engine;
pub mod sink_http;
pub mod store;

pub use config::Config;
pub use engine::{
    replay_detector, spawn_engine, DetectorLoad, EngineError, EngineEvent, EngineHandle,
    EngineSettings, EngineStatus, Flow, Phase,
};
