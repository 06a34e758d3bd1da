/// OAuth token endpoint used to exchange a refresh token for an access token
pub const DEFAULT_TOKEN_URL: &str = "https://3pauth.rainmaker.espressif.com/oauth2/token";

/// Fixed OAuth client id sent with every refresh-token grant
pub const DEFAULT_CLIENT_ID: &str = "1h7ujqjs8140n17v0ahb4n51m2";

/// Placeholder substituted with the agent id in the WebSocket URL template
pub const AGENT_ID_PLACEHOLDER: &str = "{agent_id}";

/// Capacity of the outbound send queue (frames)
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Capacity of the event delivery queue (events)
pub const DEFAULT_EVENT_CAPACITY: usize = 32;

/// Soft bound for posting an event (milliseconds)
pub const DEFAULT_EVENT_POST_TIMEOUT_MS: u64 = 1000;

/// Queue timeout for speech start/end markers (milliseconds)
pub const DEFAULT_MARKER_TIMEOUT_MS: u64 = 100;

/// HTTP timeout for the access-token exchange (milliseconds)
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 10_000;
