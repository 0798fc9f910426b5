use crate::utils::otlp::keys;

// =============================================================================
// Application Identity
// =============================================================================

/// Application name (for display and log targets)
pub const APP_NAME: &str = "otel-mutator";

/// Config file picked up from the working directory when no path is given
pub const CONFIG_FILE_NAME: &str = "otel-mutator.json";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "OTEL_MUTATOR_CONFIG";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "OTEL_MUTATOR_LOG";

/// Environment variable overriding the limiter series budget
pub const ENV_MAX_SERIES: &str = "OTEL_MUTATOR_MAX_SERIES";

/// Environment variable disabling the limiter
pub const ENV_NO_LIMITER: &str = "OTEL_MUTATOR_NO_LIMITER";

// =============================================================================
// Limiter Defaults
// =============================================================================

/// Distinct series admitted per metric name per rotation window
pub const DEFAULT_MAX_SERIES: usize = 1000;

/// Rotation window length
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 3600;

// =============================================================================
// Resolver Defaults
// =============================================================================

/// Reload interval of file-backed endpoint tables
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

/// Bound of the memoized endpoint resolution cache
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Attribute keys consulted for a raw network address, in order
pub const DEFAULT_ENDPOINT_SOURCE_KEYS: &[&str] = &[
    "ip",
    keys::NET_PEER_IP,
    keys::NET_SOCK_PEER_ADDR,
    keys::SERVER_ADDRESS,
];

/// Attribute written by the endpoint resolver
pub const DEFAULT_ENDPOINT_TARGET_KEY: &str = "service";

/// Environment used when neither record nor resource names one
pub const DEFAULT_ENVIRONMENT: &str = "generic:default";

// =============================================================================
// Normalizer Defaults
// =============================================================================

/// Max characters kept in a string attribute value
pub const DEFAULT_MAX_VALUE_LENGTH: usize = 255;

// =============================================================================
// Shutdown
// =============================================================================

/// Bounded wait for a background task to finish after cancellation
pub const STOP_TIMEOUT_SECS: u64 = 5;
