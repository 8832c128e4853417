// ── wa-connect Atoms: Constants ────────────────────────────────────────────
// All named constants for the crate live here. Config defaults point at these,
// so changing a value here changes the default without touching the engine.

// ── Retry ceiling & backoff ────────────────────────────────────────────────
// delay = min(base * 2^retry_count, cap). The different-approach path rebuilds
// the whole client identity, so it starts slower and is allowed to back off
// further than a plain reconnect.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
pub const SIMPLE_BACKOFF_BASE_MS: u64 = 2_000;
pub const SIMPLE_BACKOFF_CAP_MS: u64 = 30_000;
pub const DIFFERENT_APPROACH_BACKOFF_BASE_MS: u64 = 5_000;
pub const DIFFERENT_APPROACH_BACKOFF_CAP_MS: u64 = 120_000;

/// Pause between the teardown half of a reset and the fresh init.
pub const RESET_DELAY_MS: u64 = 1_000;

// ── QR rendering ───────────────────────────────────────────────────────────
/// The fallback poll gives up after this long without a pairing payload.
pub const QR_FALLBACK_WINDOW_SECS: u64 = 120;
pub const QR_FALLBACK_POLL_INTERVAL_MS: u64 = 2_000;
/// Minimum rendered edge length in pixels; small codes scan badly on phones.
pub const QR_MIN_DIMENSION: u32 = 300;
pub const QR_DATA_URI_PREFIX: &str = "data:image/svg+xml;base64,";

// ── Transport defaults ─────────────────────────────────────────────────────
pub const DEFAULT_PROTOCOL_VERSION: [u32; 3] = [2, 3000, 1_015_901_307];

// ── Disconnect status codes (multi-device web protocol) ────────────────────
pub const STATUS_LOGGED_OUT: u16 = 401;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_CONNECTION_LOST: u16 = 408;
pub const STATUS_MULTIDEVICE_MISMATCH: u16 = 411;
pub const STATUS_CONNECTION_CLOSED: u16 = 428;
pub const STATUS_CONNECTION_REPLACED: u16 = 440;
pub const STATUS_BAD_SESSION: u16 = 500;
pub const STATUS_UNAVAILABLE_SERVICE: u16 = 503;
pub const STATUS_RESTART_REQUIRED: u16 = 515;

// ── Working Area layout ────────────────────────────────────────────────────
pub const CREDS_FILE: &str = "creds.json";
/// Prefix for in-flight atomic writes; skipped when reading an area back.
pub const TEMP_FILE_PREFIX: &str = ".tmp-";
pub const SESSION_ENVELOPE_FORMAT: &str = "multi-file-auth/v1";

// ── Storage ────────────────────────────────────────────────────────────────
/// engine_config key the manager config is stored under.
pub const CONFIG_KEY: &str = "whatsapp_connection_config";
pub const APP_DIR_NAME: &str = "wa-connect";
pub const DB_FILE_NAME: &str = "wa-connect.db";
pub const SESSIONS_DIR_NAME: &str = "sessions";

/// Capacity of the status-event broadcast channel. Slow subscribers lag and
/// drop events rather than block the supervisor.
pub const STATUS_EVENT_CAPACITY: usize = 256;
