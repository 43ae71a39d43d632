//! # pickcell - vision-guided pick-and-place cell controller
//!
//! Drives a robot arm through a fixed pick-and-place routine:
//! - Pose requests to a vision sensor over a small TCP protocol
//! - Pixel to robot-frame calibration
//! - Bin stacking with a bounded counter persisted in a PLC data block
//! - Asynchronous safety supervision of the arm's notifications
//!
//! The arm and PLC sit behind the [`MotionActuator`] and [`BlockStore`]
//! traits; [`sim`] provides in-process implementations of both.
//!
//! ## Quick Start
//! ```no_run
//! use pickcell::sim::{Journal, MemoryStore, SimActuator};
//! use pickcell::{CellConfig, SequenceEngine};
//!
//! let config = CellConfig::from_file("config/cell.toml").unwrap();
//! let actuator = SimActuator::new(Journal::new());
//! let store = MemoryStore::new().with_block(1, 8);
//!
//! let mut engine = SequenceEngine::new(actuator, store, config).unwrap();
//! let summary = engine.run_for(3).unwrap();
//! println!("{} cycles, {} skipped", summary.cycles, summary.skipped);
//! ```

pub mod error;
pub mod types;
pub mod protocol;
pub mod transform;
pub mod vision;
pub mod actuator;
pub mod store;
pub mod safety;
pub mod routine;
pub mod engine;
pub mod sim;

pub use actuator::MotionActuator;
pub use engine::{CycleOutcome, CycleReport, EngineContext, RunSummary, SequenceEngine, StopSignal};
pub use error::{CellError, ProtocolError};
pub use routine::{CellConfig, RoutineDefinition};
pub use safety::{SafetyHandle, SafetyMonitor};
pub use store::{BlockStore, CounterStore, StackCounter};
pub use transform::Calibration;
pub use types::*;
pub use vision::PoseClient;

/// Result type alias for cell operations.
pub type Result<T> = std::result::Result<T, CellError>;
