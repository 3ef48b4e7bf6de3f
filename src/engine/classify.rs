use ulid::Ulid;

use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;

/// A booking pulled out of its item aggregate, still carrying the item
/// projection needed for the view row.
pub type BookingRow = (Booking, Ulid, String);

/// The temporal query classifier: apply the state filter against one
/// captured `now`, order by window start descending (soonest/most recent
/// first), then cut the requested page window.
pub fn page_bookings(
    mut rows: Vec<BookingRow>,
    state: StateFilter,
    now: Ms,
    offset: usize,
    limit: usize,
) -> Vec<BookingView> {
    rows.retain(|(b, _, _)| state.admits(b, now));
    rows.sort_by(|a, b| b.0.window.start.cmp(&a.0.window.start));
    rows.into_iter()
        .skip(offset)
        .take(limit)
        .map(|(b, item_id, item_name)| BookingView::project(&b, item_id, &item_name))
        .collect()
}

/// Missing LIMIT means "the biggest page we serve", never "everything".
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE)
}
