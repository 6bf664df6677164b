//! Small helpers shared across the engine.

mod duration;

pub use duration::parse_time;
