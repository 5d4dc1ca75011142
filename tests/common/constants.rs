//! Shared constants for end-to-end tests
//!
//! This module contains all constants used across the test suite.
//! When test data changes (peer names, timeouts), update only this file.

// ============================================================================
// Test Peers
// ============================================================================

/// Default well-behaved peer
pub const PEER_1: &str = "attic-archivist";

/// Second well-behaved peer
pub const PEER_2: &str = "vinyl-ripper";

/// Peer scripted to misbehave in failure tests
pub const FLAKY_PEER: &str = "dialup-dan";

// ============================================================================
// Test Timeouts and Configuration
// ============================================================================

/// Maximum time to wait for an expected event or condition (milliseconds)
pub const WAIT_TIMEOUT_MS: u64 = 10_000;

/// Polling interval when waiting on snapshots or files (milliseconds)
pub const POLL_INTERVAL_MS: u64 = 20;

/// Stall timeout the harness runs with, short enough to trip in tests
/// (milliseconds)
pub const TEST_STALL_TIMEOUT_MS: u64 = 400;
