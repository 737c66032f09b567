//! Hard limits on request sizes and ledger growth.

/// Max length of facility ids, user ids and display names.
pub const MAX_ID_LEN: usize = 128;

/// Max length of a requester display label.
pub const MAX_LABEL_LEN: usize = 256;

/// Max active reservations in one facility/date partition. Cancelled
/// history does not count.
pub const MAX_ACTIVE_PER_PARTITION: usize = 10_000;

/// Max facilities a catalog may hold.
pub const MAX_FACILITIES: usize = 1_024;

/// Max users an identity directory may hold.
pub const MAX_USERS: usize = 100_000;

/// Upper bound on internal lock-wait attempts per transaction.
pub const MAX_TXN_RETRIES: u32 = 16;

/// Max rows returned by a reservation listing.
pub const MAX_LIST_ROWS: usize = 5_000;
