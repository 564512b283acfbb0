//! LLM dispatch: a job coordinator for distributed LLM completion workers.

pub mod api;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod ratelimit;
pub mod store;
pub mod worker;
