pub mod aggregator;
pub mod collector;
pub mod error;
pub mod matrix;
pub mod orchestrator;
pub mod probe;
pub mod process;
pub mod sequence;
pub mod stats;
pub mod sweep;
pub mod trace;

pub use aggregator::{AggregatedDataset, ResultAggregator, summarize};
pub use collector::{MetricsCollector, RunLog};
pub use error::{HarnessError, Result};
pub use matrix::{EmulatorLauncher, InProcessLauncher, MatrixReport, MatrixRunner, RunLauncher};
pub use orchestrator::{Orchestrator, RunOutcome, RunReport, RunState};
pub use sweep::{NoopSweeper, ProcessSweeper, Sweeper};
pub use trace::{Trace, TraceEntry, extend_trace, generate_from_sizes};
