// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Sandcastle

// Circuit Breaker
pub const SANDCASTLE_BREAKER_THRESHOLD: &str = "SANDCASTLE_BREAKER_THRESHOLD";
pub const SANDCASTLE_BREAKER_RESET_MS: &str = "SANDCASTLE_BREAKER_RESET_MS";

// Conflict Retry
pub const SANDCASTLE_RETRY_MAX_ATTEMPTS: &str = "SANDCASTLE_RETRY_MAX_ATTEMPTS";
pub const SANDCASTLE_RETRY_DELAY_MS: &str = "SANDCASTLE_RETRY_DELAY_MS";
pub const SANDCASTLE_RETRY_BACKOFF_MULTIPLIER: &str = "SANDCASTLE_RETRY_BACKOFF_MULTIPLIER";

// Readiness Polling
pub const SANDCASTLE_READINESS_MAX_ATTEMPTS: &str = "SANDCASTLE_READINESS_MAX_ATTEMPTS";
pub const SANDCASTLE_READINESS_DELAY_MS: &str = "SANDCASTLE_READINESS_DELAY_MS";
pub const SANDCASTLE_READINESS_REQUEST_TIMEOUT_MS: &str = "SANDCASTLE_READINESS_REQUEST_TIMEOUT_MS";

// Command Execution
pub const SANDCASTLE_COMMAND_TIMEOUT_SECS: &str = "SANDCASTLE_COMMAND_TIMEOUT_SECS";
pub const SANDCASTLE_OUTPUT_MAX_CHARS: &str = "SANDCASTLE_OUTPUT_MAX_CHARS";

// Port Configuration
pub const SANDCASTLE_PORT_RANGE_START: &str = "SANDCASTLE_PORT_RANGE_START";
pub const SANDCASTLE_PORT_RANGE_END: &str = "SANDCASTLE_PORT_RANGE_END";

// Paths & Storage
pub const SANDCASTLE_SANDBOX_ROOT: &str = "SANDCASTLE_SANDBOX_ROOT";
pub const SANDCASTLE_DATABASE_URL: &str = "SANDCASTLE_DATABASE_URL";

// Container Runtime
pub const SANDCASTLE_RUNTIME_IMAGE: &str = "SANDCASTLE_RUNTIME_IMAGE";

// Model Provider
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ANTHROPIC_MODEL: &str = "ANTHROPIC_MODEL";
