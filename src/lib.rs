pub mod bridge;
pub mod config;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod report;
pub mod savepoint;
pub mod schema;
pub mod store;
pub mod stream;
pub mod util;
pub mod validation;
