//! Poll filters: the criteria they select records by and the registry holding them.

mod registry;
mod spec;

pub use registry::{FilterChanges, FilterId, FilterInfo, FilterKind, FilterLimits, FilterRegistry};
pub use spec::{BlockParam, BlockScope, FilterSpec, TopicSpec, MAX_TOPICS};
