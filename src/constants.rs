// Can this ever change?
pub const CHALLENGE_SIZE_BYTES: usize = 32;
pub const AUTHENTICATOR_TIMEOUT: u32 = 60000;

// rpIdHash (32) + flags (1) + signCount (4)
pub const AUTHENTICATOR_DATA_MIN_LEN: usize = 37;

pub const FLAG_USER_PRESENT: u8 = 1 << 0;
pub const FLAG_USER_VERIFIED: u8 = 1 << 2;
pub const FLAG_ATTESTED_CREDENTIAL_DATA: u8 = 1 << 6;
pub const FLAG_EXTENSION_DATA: u8 = 1 << 7;

pub const METADATA_CACHE_SIZE: usize = 64;

pub const CLIENT_DATA_TYPE_CREATE: &str = "webauthn.create";
pub const CLIENT_DATA_TYPE_GET: &str = "webauthn.get";

pub const USER_IDENTIFIER_PATTERN: &str = r"^[^@]+@[^@]+\.[^@]+$";
