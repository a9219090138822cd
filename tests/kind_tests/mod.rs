//! Integration tests for the Shipyard operator
//!
//! These tests tell the story of how a platform team publishes applications
//! and how Shipyard converges clusters onto them.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating and reading Shipyard resources
//!   through the Kubernetes API
//!
//! - `convergence`: Stories about the synthesizer and the installation
//!   controller driving real resources, with a recording installer standing
//!   in for helm
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --test-threads=1
//! ```

mod convergence;
mod crd_operations;
mod helpers;
