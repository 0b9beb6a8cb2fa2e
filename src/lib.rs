pub mod cli;
pub mod config;
pub mod executor;
pub mod git;
pub mod inspect;
pub mod introspect;
pub mod model;
pub mod plan;
pub mod resolver;
pub mod site;

mod api;
mod flock;

pub use api::{Pib, PibBuilder, Steps};
