//! Recursive coordinate bisection for distributed geometric load balancing.
//!
//! Every process registers callbacks describing its local objects and calls
//! [partition::Partitioner::partition] collectively. The processes are split
//! recursively into halves by axis-aligned cuts until every process owns one
//! region of space holding an approximately equal share of the total weight.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod bisect;
pub mod callbacks;
pub mod comm;
pub mod config;
pub mod constants;
pub mod dot;
pub mod error;
pub mod geometry;
pub mod partition;
pub mod tools;
pub mod tree;
