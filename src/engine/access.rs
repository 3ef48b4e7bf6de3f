use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Structural checks on a window: chronological, within the sane
/// timestamp range, not absurdly long.
pub(crate) fn validate_window(window: &Window) -> Result<(), EngineError> {
    use crate::limits::*;
    if window.start >= window.end {
        return Err(EngineError::InvalidWindow {
            start: window.start,
            end: window.end,
        });
    }
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// Creation-time check: structural validity plus present-or-future start.
pub(crate) fn validate_window_at(window: &Window, now: Ms) -> Result<(), EngineError> {
    validate_window(window)?;
    if window.start < now {
        return Err(EngineError::WindowInPast {
            start: window.start,
            now,
        });
    }
    Ok(())
}

/// Visibility guard: a booking is observable by its booker and by the
/// owner of its item, nobody else.
pub(crate) fn check_party(
    user_id: Ulid,
    booking: &Booking,
    owner_id: Ulid,
) -> Result<(), EngineError> {
    if booking.booker_id == user_id || owner_id == user_id {
        Ok(())
    } else {
        Err(EngineError::NotParty {
            user_id,
            booking_id: booking.id,
        })
    }
}

/// Mutation guard: only the item's owner may act.
pub(crate) fn check_owner(user_id: Ulid, item: &ItemState) -> Result<(), EngineError> {
    if item.owner_id == user_id {
        Ok(())
    } else {
        Err(EngineError::NotOwner {
            user_id,
            item_id: item.id,
        })
    }
}
