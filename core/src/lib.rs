pub mod dispatch;
pub mod orchestrator;
pub mod store;
pub mod worker;
