//! printwatch Library
//!
//! Watches cameras pointed at 3D printers, classifies live frames for print
//! defects and raises time-boxed alerts that can pause or cancel the job.
//!
//! ## Architecture
//!
//! 1. SharedStream - one capture thread per camera, shared by all consumers
//! 2. CameraState - lockable camera records, persisted through ConfigStore
//! 3. Detection - per-camera detection loop with majority-vote smoothing
//! 4. AlertManager - alert countdown and resolution
//! 5. RealtimeHub - throttled SSE event distribution
//! 6. StreamOptimizer - feed settings by exposure mode, MJPEG feed
//! 7. Printer / Notifier / Inference - external collaborators
//! 8. WebAPI - REST API endpoints

pub mod alert_manager;
pub mod camera_state;
pub mod config_store;
pub mod detection;
pub mod error;
pub mod frame_adjust;
pub mod frame_source;
pub mod inference;
pub mod models;
pub mod notifier;
pub mod printer;
pub mod realtime_hub;
pub mod shared_stream;
pub mod state;
pub mod stream_optimizer;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
