// src/lib.rs
// Library surface shared by the binary and the integration tests.

pub mod boundary;
pub mod broker;
pub mod collection;
pub mod collector;
pub mod config;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod processing;
pub mod processor;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod store;
pub mod transform;

pub use crate::collector::{Collector, CollectorMetrics};
pub use crate::error::{PipelineError, Result};
pub use crate::model::{NewsItem, NewsMessage};
pub use crate::processor::{Processor, ProcessorMetrics};
pub use crate::shutdown::Shutdown;
