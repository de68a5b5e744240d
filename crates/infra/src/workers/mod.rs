//! Background consumers of the job lifecycle bus.

pub mod lifecycle_observer;

pub use lifecycle_observer::{LifecycleObserver, ObserverHandle, log_job_event, spawn_lifecycle_logger};
