mod job;
mod state;

pub use job::{Job, JobReport, ShotAsset, ShotParams, ShotRequest, StateTransition};
pub use state::{JobState, StateMachine};
