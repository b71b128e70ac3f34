//! Integration test suite for agentrelay.
//!
//! These tests drive the orchestrator, the filesystem hand-off and the
//! health monitor together against temporary shared directories.
//!
//! # Test Categories
//!
//! - `dependency_cascade`: readiness propagation through the task graph
//! - `delegation`: delegation pickup through the shared directory
//! - `dispatch`: concurrency caps, ordering and dispatch failures
//! - `health`: liveness, system status, heartbeats and the cost ledger
//!
//! Dispatch and announce go through in-memory mocks, so no agent process
//! is needed.

mod fixtures;

mod delegation;
mod dependency_cascade;
mod health;
