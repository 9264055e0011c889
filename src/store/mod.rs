//! Persistence seams: job records and limiter counters.
//!
//! Both stores are traits so a shared external store can back several engine
//! instances; the in-memory implementations serve a single process.

mod job_store;
mod rate_store;

pub use job_store::{InMemoryJobStore, JobStore};
pub use rate_store::{InMemoryRateStore, RateStore, WindowDecision};
