pub mod config;
pub mod dashboard;
pub mod error;
pub mod node;
pub mod ratelimit;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod worker;
