//! Redaction service library
//!
//! Wires the redaction core to its external collaborators: layout
//! extraction, PII detection, optional entity recognition and blob delivery.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod pipeline;

#[cfg(test)]
mod tests;

pub use config::{Config, ConfigError};
pub use error::PipelineError;
pub use pipeline::{output_name, DeliveryReceipt, InboundDocument, Pipeline, PipelineSettings, Stage};
