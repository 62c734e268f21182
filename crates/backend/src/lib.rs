pub mod arc;
pub mod cache;
pub mod logging;
pub mod pipeline;
pub mod processor;
pub mod scheduling;

pub use arc::{ArcKey, ArcResult, CacheArc, ConditionSet, Content, ProcessorId, SharedArc};
pub use arcflow_core::{Address, Config, Headers, config};
pub use cache::{CacheArcProvider, FilteredAddressCache, ProcessorCache};
pub use pipeline::{PipelineContext, PipelineError, Request};
pub use processor::{Processor, ProcessorRegistry};
