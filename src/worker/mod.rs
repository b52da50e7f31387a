//! Agent side of the fleet.
//!
//! - [`agent`]: registration, the per-delivery processor and the fetch workflow
//! - [`executor`]: the scraper collaborator and its in-place retry loop
//! - [`heartbeat`]: keeps the agent's status record fresh

pub mod agent;
pub mod executor;
pub mod heartbeat;

pub use agent::{Agent, ProcessOutcome};
pub use executor::{CommandFetcher, FetchExecutor, ReplayFetcher, ScrapeError};
