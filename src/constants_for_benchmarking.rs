/// Concurrent requests fired per burst
pub const BURST: usize = 100;

/// Distinct keys a split burst is spread over
pub const KEYS: usize = 10;

/// Keys read back on the hit path
pub const GET_MANY: usize = 10_000;
