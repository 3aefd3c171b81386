//! Automation engine that drives CONTPAQi Contabilidad through its windows to
//! post accounting entries from matched CFDI documents.

pub mod bridge;
pub mod clock;
pub mod config;
pub mod data;
pub mod dialog;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod locator;
pub mod matcher;
pub mod primitives;
pub mod surface;
pub mod workflow;

#[cfg(test)]
mod testkit;
