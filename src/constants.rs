//! # Orchestration Constants
//!
//! Retry budgets, delays, port ranges and wire-level markers used across the
//! service manager, the backends and the worker protocol. These constants are
//! the single source of truth for the bounds the engine enforces.
//!
//! ## Cross-References
//!
//! - [`crate::service`]: port range, allocation retries, readiness budget
//! - [`crate::backend`]: worker port, debug port, Singularity CLI timeouts
//! - [`crate::protocol`]: sentinel markers and frame limits

use std::time::Duration;

// =============================================================================
// Port Allocation
// =============================================================================
//
// Ports are handed out from [DEFAULT_PORT_START, MAX_SERVICE_PORT]. A port
// that has been handed out once is never handed out again for the lifetime of
// the process, so the usable pool shrinks monotonically.
// =============================================================================

/// First host port considered for worker services.
pub const DEFAULT_PORT_START: u16 = 8101;

/// Last host port considered for worker services (top of the registered range).
pub const MAX_SERVICE_PORT: u16 = 49151;

/// Upper bound (exclusive) of the random back-off while another caller holds
/// the port lock, in milliseconds.
pub const PORT_LOCK_JITTER_MS: u64 = 300;

/// How many times a backend "port already allocated" race is retried with a
/// fresh port before the start is considered failed.
pub const PORT_ALLOCATION_RETRIES: u32 = 500;

/// Delay between "port already allocated" retries.
pub const PORT_ALLOCATION_RETRY_DELAY: Duration = Duration::from_millis(200);

// =============================================================================
// Readiness Checks
// =============================================================================
//
// Freshly started HTTP workers are checked with `echo test`. Connection resets
// mean the worker has not bound its socket yet. After the retry budget is
// spent the manager waits once more and proceeds regardless.
// =============================================================================

/// Maximum readiness check attempts.
pub const READINESS_RETRIES: u32 = 500;

/// Delay between readiness check attempts.
pub const READINESS_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Final wait after the attempt budget is exhausted.
pub const READINESS_FALLBACK_WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Worker Container Layout
// =============================================================================

/// Port the worker server listens on inside the container.
///
/// Coupled with the worker image: the image's entrypoint binds this port
/// unless told otherwise by its launch configuration.
pub const WORKER_CONTAINER_PORT: u16 = 8881;

/// Debug port exposed by worker images in debug mode.
pub const WORKER_DEBUG_PORT: u16 = 4444;

/// Container path the run's input directory is bound to (read-only).
pub const CONTAINER_INPUT_DIR: &str = "/input";

/// Container path the run's output directory is bound to.
pub const CONTAINER_OUTPUT_DIR: &str = "/output";

/// Container path the run's cache directory is bound to.
pub const CONTAINER_CACHE_DIR: &str = "/cache";

/// Environment variable carrying the service port into the container.
pub const WORKER_PORT_ENV: &str = "FEDRUN_PORT";

/// Environment variable enabling verbose logging inside the container.
pub const WORKER_DEBUG_ENV: &str = "FEDRUN_DEBUG";

// =============================================================================
// Backend Timeouts
// =============================================================================

/// Timeout for a single Singularity CLI call (`instance start/list/stop`).
pub const SINGULARITY_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for pulling or converting one image.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(1800);

/// Seconds Docker waits after SIGTERM before killing a stopped worker.
pub const CONTAINER_STOP_GRACE_SECS: i32 = 10;

/// Maximum CLI output captured from a backend subprocess (1 MiB).
pub const MAX_COMMAND_OUTPUT: usize = 1024 * 1024;

// =============================================================================
// Worker Protocol
// =============================================================================

/// Opening marker of a stdout segment in an HTTP response body.
pub const STDOUT_START: &[u8] = b"stdoutSTART\n";
/// Closing marker of a stdout segment.
pub const STDOUT_END: &[u8] = b"stdoutEND\n";
/// Opening marker of a stderr segment.
pub const STDERR_START: &[u8] = b"stderrSTART\n";
/// Closing marker of a stderr segment.
pub const STDERR_END: &[u8] = b"stderrEND\n";
/// Opening marker of the exit code segment.
pub const EXITCODE_START: &[u8] = b"exitcodeSTART\n";
/// Closing marker of the exit code segment.
pub const EXITCODE_END: &[u8] = b"exitcodeEND\n";

/// Maximum size of an HTTP header block before the decoder gives up (64 KiB).
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum length of a chunk-size line, extensions included.
pub const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Maximum size of the control frame (1 MiB).
pub const MAX_CONTROL_FRAME_SIZE: usize = 1024 * 1024;

/// Size of the stdin chunks the clients write (64 KiB).
pub const INPUT_CHUNK_SIZE: usize = 64 * 1024;

/// Timeout for connecting to a worker.
pub const WORKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket connect attempts refused or reset before the invocation fails.
pub const WS_CONNECT_RETRIES: u32 = 10;

/// Linear back-off step between WebSocket connect attempts (attempt `n`
/// waits `n` steps).
pub const WS_CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// Read buffer size for worker sockets and process pipes.
pub const IO_BUFFER_SIZE: usize = 16 * 1024;

/// How long the worker waits for the client to close the WebSocket after the
/// exit code was sent.
pub const WS_CLOSE_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Pipeline
// =============================================================================

/// Capacity of the per-run state event channel.
pub const STATE_EVENT_CAPACITY: usize = 256;

/// Subdirectory of the operating directory holding per-run outputs.
pub const OUTPUT_DIR: &str = "output";

/// Subdirectory of the operating directory holding per-run caches.
pub const CACHE_DIR: &str = "cache";

// =============================================================================
// Identifier Validation
// =============================================================================

/// Valid characters for service and run identifiers.
///
/// Identifiers end up in container names and host paths, so `/` and `.` are
/// excluded.
pub const SERVICE_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum service identifier length.
pub const MAX_SERVICE_ID_LEN: usize = 128;

/// Validates a service or run identifier.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before using the identifier"]
pub fn validate_service_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("service ID cannot be empty");
    }
    if id.len() > MAX_SERVICE_ID_LEN {
        return Err("service ID exceeds maximum length");
    }
    if !id.chars().all(|c| SERVICE_ID_VALID_CHARS.contains(c)) {
        return Err("service ID contains invalid characters");
    }
    Ok(())
}
