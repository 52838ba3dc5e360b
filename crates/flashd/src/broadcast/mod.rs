//! Job event fan-out for dashboards, the monitor loop and other observers.

pub mod job_events;

pub use job_events::{JobEvent, JobEventBroadcaster, JobEventTracker, JobPhase, JobStatus};
