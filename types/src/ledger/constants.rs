/// Coins seeded into a balance record the first time an account is seen
pub const STARTING_COINS: u64 = 10_000;

/// Tickets seeded into a balance record the first time an account is seen
pub const STARTING_TICKETS: u64 = 0;

/// Maximum number of transactions kept in the in-memory history
pub const HISTORY_CAP: usize = 50;

/// Smallest amount accepted by the transfer procedure
pub const MIN_TRANSFER_AMOUNT: u64 = 10;

/// Coins granted by the daily bonus
pub const DAILY_BONUS_AMOUNT: u64 = 500;
