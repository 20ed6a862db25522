pub mod job_store;
pub mod processor;
pub mod queue;
pub mod redis_store;
pub mod status;
pub mod storage;
pub mod submission;
pub mod worker;
