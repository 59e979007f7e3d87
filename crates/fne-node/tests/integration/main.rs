//! Integration test entry point for fne-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod parrot;
mod pdu;
mod routing;
