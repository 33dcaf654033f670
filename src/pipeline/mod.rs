//! Shared dataflow types for the stage workers.

pub mod messages;
