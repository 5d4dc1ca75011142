//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{candidate_for, track, TestHarness, PEER_1};
//!
//! #[tokio::test]
//! async fn test_download() {
//!     let mut harness = TestHarness::spawn().await;
//!     let request = track("Massive Attack", "Teardrop");
//!     harness
//!         .network
//!         .set_default_results(vec![candidate_for(PEER_1, &request)]);
//!
//!     let job_id = harness.queue_one(request).await;
//!     harness.wait_for_completed(&job_id).await;
//! }
//! ```

mod constants;
mod fixtures;
mod network;

// Public API - this is what tests import
pub use constants::*;
pub use fixtures::{
    candidate_for, candidate_size, remote_path_for, test_settings, track, TestHarness,
};
pub use network::{expected_payload, MockNetwork, TransferScript};
