//! Shared contracts for the Facewatch pipeline: configuration, wire and
//! storage models, the blob/relational store clients, and the JetStream
//! queue layer used by the ingest node, vision workers, and the event
//! distributor.

pub mod config;
pub mod models;
pub mod queue;
pub mod storage;
