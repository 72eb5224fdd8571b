pub mod config;
pub mod sample;
pub mod scenario;

pub use config::{
    ConfigError, EmulatorConfig, HarnessConfig, LayoutConfig, RunConfig, SweepConfig,
};
pub use sample::{Measurement, MetricSample, Role, SummaryRow};
pub use scenario::{Profile, RunConfigOverride, Scheme, SchemeSelection};
