pub mod agents;
pub mod approval;
pub mod capabilities;
pub mod cli;
pub mod clock;
pub mod config;
pub mod connector;
pub mod doctor;
pub mod error;
pub mod executor;
pub mod guardrail;
pub mod itsm;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod profiles;
pub mod quality;
pub mod resolver;
pub mod server;
pub mod store;
pub mod tool_policy;
pub mod validation;

#[cfg(test)]
mod tests;
