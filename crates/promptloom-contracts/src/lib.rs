pub mod batch;
pub mod events;
pub mod jobs;
pub mod naming;
