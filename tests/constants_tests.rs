//! Tests for constants module.
//!
//! Validates that ports, retry budgets and wire markers have the values the
//! worker images depend on, and that derived limits stay consistent.

use fedrun::constants::*;
use std::time::Duration;

// =============================================================================
// Port Range Tests
// =============================================================================

#[test]
fn test_port_range_ordered() {
    assert!(DEFAULT_PORT_START < MAX_SERVICE_PORT, "port range is empty");
    assert_eq!(DEFAULT_PORT_START, 8101);
    assert_eq!(MAX_SERVICE_PORT, 49151, "range should stop below ephemeral ports");
}

#[test]
fn test_worker_ports_outside_service_range() {
    assert_eq!(WORKER_CONTAINER_PORT, 8881);
    assert_eq!(WORKER_DEBUG_PORT, 4444);
    assert!(
        WORKER_DEBUG_PORT < DEFAULT_PORT_START,
        "debug port should not collide with service ports"
    );
}

#[test]
fn test_port_lock_jitter_positive() {
    assert!(PORT_LOCK_JITTER_MS > 0, "jitter range cannot be empty");
}

// =============================================================================
// Retry Budget Tests
// =============================================================================

#[test]
fn test_port_retry_budget() {
    assert_eq!(PORT_ALLOCATION_RETRIES, 500);
    assert_eq!(PORT_ALLOCATION_RETRY_DELAY, Duration::from_millis(200));
}

#[test]
fn test_readiness_budget() {
    assert_eq!(READINESS_RETRIES, 500);
    assert_eq!(READINESS_RETRY_DELAY, Duration::from_millis(100));
    assert_eq!(READINESS_FALLBACK_WAIT, Duration::from_secs(5));
}

#[test]
fn test_ws_backoff_total_reasonable() {
    // Linear back-off: attempt n waits n steps.
    let total: u32 = (1..=WS_CONNECT_RETRIES).sum();
    let worst = WS_CONNECT_BACKOFF * total;
    assert!(
        worst <= Duration::from_secs(30),
        "connect back-off too long before giving up"
    );
}

// =============================================================================
// Wire Marker Tests
// =============================================================================

#[test]
fn test_sentinels_are_newline_terminated() {
    for marker in [
        STDOUT_START,
        STDOUT_END,
        STDERR_START,
        STDERR_END,
        EXITCODE_START,
        EXITCODE_END,
    ] {
        assert_eq!(marker.last(), Some(&b'\n'), "marker {:?}", marker);
    }
    assert_eq!(STDOUT_START, b"stdoutSTART\n");
    assert_eq!(EXITCODE_END, b"exitcodeEND\n");
}

#[test]
fn test_frame_limits_ordered() {
    assert!(MAX_CHUNK_SIZE_LINE < MAX_HEADER_SIZE);
    assert!(INPUT_CHUNK_SIZE <= MAX_CONTROL_FRAME_SIZE);
    assert!(IO_BUFFER_SIZE > 0);
}

// =============================================================================
// Timeout Tests
// =============================================================================

#[test]
fn test_image_pull_timeout_reasonable() {
    assert!(
        IMAGE_PULL_TIMEOUT >= SINGULARITY_COMMAND_TIMEOUT,
        "pulls should get at least the plain command timeout"
    );
    assert!(CONTAINER_STOP_GRACE_SECS > 0);
}

// =============================================================================
// Identifier Validation Tests
// =============================================================================

#[test]
fn test_validate_service_id() {
    assert!(validate_service_id("run1-comp_a").is_ok());
    assert!(validate_service_id("").is_err());
    assert!(validate_service_id("a/b").is_err());
    assert!(validate_service_id("a.b").is_err());
    assert!(validate_service_id(&"x".repeat(MAX_SERVICE_ID_LEN)).is_ok());
    assert!(validate_service_id(&"x".repeat(MAX_SERVICE_ID_LEN + 1)).is_err());
}

#[test]
fn test_container_dirs_absolute() {
    for dir in [CONTAINER_INPUT_DIR, CONTAINER_OUTPUT_DIR, CONTAINER_CACHE_DIR] {
        assert!(dir.starts_with('/'), "{dir} must be absolute");
    }
}
