//! Protocol constants and measurement defaults

/// Default chunk size for throughput phases (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default download phase duration (milliseconds)
pub const DEFAULT_DOWNLOAD_DURATION_MS: u64 = 8_000;

/// Default upload phase duration (milliseconds)
pub const DEFAULT_UPLOAD_DURATION_MS: u64 = 5_000;

/// Default per-probe echo timeout (milliseconds)
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;

/// Default number of latency probes per session
pub const DEFAULT_PROBE_COUNT: u32 = 10;

/// Default pause between latency probes (milliseconds)
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 100;

/// Default progress reporting interval (milliseconds)
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;

/// Default fraction of a throughput phase used for the aggregate rate
pub const DEFAULT_WINDOW_FRACTION: f64 = 0.8;

/// Default sanity ceiling for throughput (10 Gbps)
pub const DEFAULT_RATE_CEILING_BPS: f64 = 10_000_000_000.0;

/// Largest chunk a peer may request (16 MiB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Error codes carried by `error` control messages
pub mod error_codes {
    /// Request could not be parsed or has an unknown type
    pub const BAD_REQUEST: u16 = 400;
    /// Requested chunk size or duration exceeds server limits
    pub const LIMIT_EXCEEDED: u16 = 413;
    /// A stream is already active on this connection
    pub const BUSY: u16 = 409;
    /// Server at capacity
    pub const UNAVAILABLE: u16 = 503;
}
