//! Batch Text Classification Pipeline
//!
//! This library provides the core functionality for batch-classify, which
//! splits customer text files into batches, submits them to a managed batch
//! inference service and writes the classified results back, tracking every
//! record in a PostgreSQL job status ledger and moving work between stages
//! through Redis queues.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
pub mod telemetry;
