//! Ontology extraction and maintenance engine
//!
//! Builds a semantic model (entities, column roles, relationships) of a
//! relational datasource and keeps it current as the live schema drifts.

pub mod catalog;
pub mod changes;
pub mod config;
pub mod crypto;
pub mod datasource;
pub mod dispatcher;
pub mod enrichment;
pub mod entity;
pub mod error;
pub mod features;
pub mod model;
pub mod pipeline;
pub mod precedence;
pub mod relationships;
pub mod seed;
pub mod semantic;
pub mod tools;

#[cfg(test)]
pub mod testing;
