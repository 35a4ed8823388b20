pub mod context;
pub mod dep_graph;
pub mod error;
pub mod events;
pub mod fetch;
pub mod item;
pub mod manager;
pub mod registry;
pub mod setting;
pub mod store;

mod serialize;
mod shared;

#[cfg(test)]
pub mod harness;
#[cfg(test)]
mod scenarios;
