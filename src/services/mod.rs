pub mod credits;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;
