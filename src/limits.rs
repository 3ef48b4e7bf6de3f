//! Hard caps on inputs and state growth. All are generous for a single
//! marketplace instance; hitting one is a client error, not a fault.

use crate::model::Ms;

/// Timestamps must be non-negative Unix milliseconds.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// Upper bound on timestamps: 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single reservation window may span at most one year.
pub const MAX_WINDOW_DURATION_MS: Ms = 365 * 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_COMMENT_LEN: usize = 2_048;

pub const MAX_USERS: usize = 1_000_000;
pub const MAX_ITEMS_PER_OWNER: usize = 10_000;
pub const MAX_BOOKINGS_PER_ITEM: usize = 100_000;
pub const MAX_COMMENTS_PER_ITEM: usize = 10_000;
pub const MAX_REQUESTS: usize = 1_000_000;

/// Largest page a single listing may return; also the default when the
/// client omits LIMIT.
pub const MAX_PAGE_SIZE: usize = 1_000;
