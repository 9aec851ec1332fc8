//! pixmill
//!
//! Batch media converter: scans a directory, classifies each file and
//! rewrites it in place as JPEG XL, AVIF or MOV through external encoders,
//! with resumable state, adaptive concurrency and atomic replacement.

pub mod batch;
pub mod classify;
pub mod convert;
pub mod encode;
pub mod engine;
pub mod media;
pub mod optimizer;
pub mod replace;
pub mod routing;
pub mod scan;
pub mod store;
pub mod telemetry;
pub mod tools;

pub use pixmill_config as config;
pub use pixmill_config::{AppMode, Config};
pub use batch::{BatchDecisionManager, DecisionOutcome, DecisionRecord};
pub use classify::{Assessment, HeuristicClassifier, QualityClassifier};
pub use convert::{FileProcessor, ProcessError};
pub use engine::{Engine, EngineComponents, EngineError, RunSummary};
pub use media::{
    MediaRecord, MediaType, ProcessingResult, ProcessingStatus, QualityTier, Statistics,
    TargetFormat,
};
pub use optimizer::ConcurrencyOptimizer;
pub use replace::{ReplaceError, ReplaceManager};
pub use routing::{get_mode, ProcessingMode};
pub use scan::scan_directory;
pub use store::{DbInfo, StateManager, StoreError};
pub use telemetry::{PerformanceSnapshot, TelemetryCollector};
pub use tools::{ToolKind, ToolRouter, ToolVersion};
