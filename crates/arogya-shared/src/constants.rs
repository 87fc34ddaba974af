use uuid::Uuid;

/// Separator between the two sorted principal ids of a private room
pub const ROOM_ID_SEPARATOR: char = ':';

/// UUID v5 namespace used to derive private conversation ids from room ids
pub const PRIVATE_ROOM_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_93c2_5d0e_4b7a_9f3e_2c81_d4a0_b6e5);

/// Minimum number of distinct members (besides the owner) in a new group
pub const MIN_GROUP_MEMBERS: usize = 2;

/// Maximum group name length in characters
pub const MAX_GROUP_NAME_LEN: usize = 100;

/// Maximum message content length in bytes (16 KiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Default and maximum history page sizes
pub const DEFAULT_HISTORY_PAGE: u32 = 50;
pub const MAX_HISTORY_PAGE: u32 = 200;

/// Default HTTP / WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// WebSocket close codes for fatal protocol outcomes
pub const CLOSE_PROTOCOL_VIOLATION: u16 = 4400;
pub const CLOSE_AUTH_REQUIRED: u16 = 4401;
pub const CLOSE_IDLE_TIMEOUT: u16 = 4408;
pub const CLOSE_SLOW_CONSUMER: u16 = 4429;
