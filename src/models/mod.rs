pub mod batch;
pub mod config;
pub mod jobconfig;
pub mod sample;

pub use batch::{BatchJob, BatchKind, JobStatus};
pub use config::PicoConfig;
pub use jobconfig::{ChunkMap, JobConfig};
pub use sample::{DataType, FileSource, Sample};
