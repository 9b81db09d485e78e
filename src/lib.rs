pub mod batch;
pub mod chunks;
pub mod cli;
pub mod color;
pub mod das;
pub mod errors;
pub mod inspect;
pub mod jobs;
pub mod models;
pub mod runner;
pub mod samples;
pub mod storage;
