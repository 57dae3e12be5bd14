pub mod capabilities;
pub mod events;
pub mod ledger;
pub mod limiter;
pub mod merge;
pub mod normalize;
pub mod orchestrator;
pub mod page_cache;
pub mod phases;
pub mod run_guard;
pub mod service;
pub mod store;
pub mod watchdog;

pub use orchestrator::Orchestrator;
pub use service::EnrichmentService;
