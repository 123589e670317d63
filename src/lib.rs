//! rashomon: local interception proxy for AI-agent network traffic
//!
//! Coding agents reach the network through a loopback proxy. Every request is
//! attributed to an agent, evaluated against layered policy documents and
//! recorded in a hash-chained audit ledger before anything leaves the machine.
//!
//! # Security Model
//!
//! The security model is **fail-closed**: when a lookup or scan cannot
//! complete, the request is blocked and the reason is audited.
//!
//! # Architecture
//!
//! - **Proxy**: loopback HTTP proxy with TLS interception via a local CA
//! - **Interceptor**: the per-request decision pipeline
//! - **Policy**: YAML/TOML policy documents merged by priority
//! - **Domains / Agents / Rate limits / Scanner / Intent**: pipeline stages
//! - **Audit**: SQLite-backed, hash-chained decision ledger
//! - **Telemetry**: sanitized security events for fleet aggregation
//! - **Config**: hierarchical TOML daemon settings

#![warn(clippy::all)]

pub mod agents;
pub mod audit;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod domains;
pub mod intent;
pub mod interceptor;
pub mod orchestrator;
pub mod policy;
pub mod proxy;
pub mod ratelimit;
pub mod scanner;
pub mod storage;
pub mod telemetry;
pub mod views;
