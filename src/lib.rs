pub mod archive;
pub mod cli;
pub mod config;
pub mod error;
pub mod inject;
pub mod job;
pub mod payload;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod report;
pub mod resources;
pub mod service;
pub mod sign;
pub mod transform;
pub mod util;
pub mod workspace;
