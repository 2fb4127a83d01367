pub mod dataset;
pub mod engine;
pub mod error;
pub mod fmo;
pub mod geometry;
pub mod knn;
pub mod persist;
pub mod population;
pub mod region;
pub mod registry;
pub mod set_algebra;
pub mod strategy;

pub use dataset::{CsvDatasetProvider, DatasetProvider, EventId, EventTable};
pub use engine::{EditOutcome, EngineParameters, GateOutcome, GatingEngine, RemovalOutcome};
pub use error::{ErrorCode, GatingError};
pub use fmo::{AxisProfile, FmoCache};
pub use geometry::{Geometry, Quadrant, Sign};
pub use persist::{GateRecord, JsonFileAdapter, PersistenceAdapter, PopulationRecord, Snapshot};
pub use population::{Cluster, Population, PopulationTree, ROOT};
pub use registry::{Gate, GateRegistry, GateState};
pub use strategy::{GateOutput, GatingStrategy, StrategyResult};
