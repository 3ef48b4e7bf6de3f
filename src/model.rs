use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open reservation window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Active at `t`: started, not yet ended.
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    pub fn is_past(&self, now: Ms) -> bool {
        self.end < now
    }

    pub fn is_future(&self, now: Ms) -> bool {
        self.start > now
    }
}

/// Approval workflow state of a booking. `Waiting` is the only creation state;
/// `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Waiting,
    Approved,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Waiting => "WAITING",
            BookingStatus::Approved => "APPROVED",
            BookingStatus::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing filter: classifies bookings against the evaluation instant
/// and/or their workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    All,
    Current,
    Past,
    Future,
    Waiting,
    Rejected,
}

impl StateFilter {
    /// Parse the wire spelling. Unknown spellings are a caller error and
    /// must not fall back to `All`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALL" => Some(StateFilter::All),
            "CURRENT" => Some(StateFilter::Current),
            "PAST" => Some(StateFilter::Past),
            "FUTURE" => Some(StateFilter::Future),
            "WAITING" => Some(StateFilter::Waiting),
            "REJECTED" => Some(StateFilter::Rejected),
            _ => None,
        }
    }

    /// Predicate from the classification table, evaluated against one
    /// captured `now` for the whole listing.
    pub fn admits(&self, booking: &Booking, now: Ms) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Current => booking.window.contains_instant(now),
            StateFilter::Past => booking.window.is_past(now),
            StateFilter::Future => booking.window.is_future(now),
            StateFilter::Waiting => booking.status == BookingStatus::Waiting,
            StateFilter::Rejected => booking.status == BookingStatus::Rejected,
        }
    }
}

/// A reservation of an item by a user. Lives inside its item's aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub booker_id: Ulid,
    pub window: Window,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Ulid,
    pub author_id: Ulid,
    pub text: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

/// A want-ad: "does anyone have X to lend?". Items may be listed in
/// response by carrying the request's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRequest {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub description: String,
    pub created_at: Ms,
}

/// The item aggregate: catalog fields plus every booking and comment on
/// the item. Bookings are kept sorted by window start.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub description: String,
    pub available: bool,
    pub request_id: Option<Ulid>,
    pub bookings: Vec<Booking>,
    pub comments: Vec<Comment>,
}

impl ItemState {
    pub fn new(
        id: Ulid,
        owner_id: Ulid,
        name: String,
        description: String,
        available: bool,
        request_id: Option<Ulid>,
    ) -> Self {
        Self {
            id,
            owner_id,
            name,
            description,
            available,
            request_id,
            bookings: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by window.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.window.start, |b| b.window.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Latest approved booking already begun at `now`, if any.
    /// Relies on the start-sorted order: the last qualifying entry wins.
    pub fn last_booking(&self, now: Ms) -> Option<&Booking> {
        self.bookings
            .iter()
            .rev()
            .find(|b| b.status == BookingStatus::Approved && b.window.start <= now)
    }

    /// Earliest approved booking still ahead of `now`, if any.
    pub fn next_booking(&self, now: Ms) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.status == BookingStatus::Approved && b.window.start > now)
    }

    /// Existence gate for post-booking actions: the booker finished a
    /// reservation of this item before `now`, regardless of status.
    pub fn has_completed(&self, booker_id: Ulid, now: Ms) -> bool {
        self.bookings
            .iter()
            .any(|b| b.booker_id == booker_id && b.window.end < now)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        id: Ulid,
        name: String,
        email: String,
    },
    UserUpdated {
        id: Ulid,
        name: Option<String>,
        email: Option<String>,
    },
    UserDeleted {
        id: Ulid,
    },
    ItemCreated {
        id: Ulid,
        owner_id: Ulid,
        name: String,
        description: String,
        available: bool,
        request_id: Option<Ulid>,
    },
    ItemUpdated {
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        available: Option<bool>,
    },
    BookingRequested {
        id: Ulid,
        item_id: Ulid,
        booker_id: Ulid,
        window: Window,
    },
    BookingDecided {
        id: Ulid,
        item_id: Ulid,
        approved: bool,
    },
    CommentAdded {
        id: Ulid,
        item_id: Ulid,
        author_id: Ulid,
        text: String,
        created_at: Ms,
    },
    RequestCreated {
        id: Ulid,
        requester_id: Ulid,
        description: String,
        created_at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A booking joined with its minimal item and booker projections:
/// `{id, window, status, item:{id,name}, booker:{id}}` flattened to a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub id: Ulid,
    pub item_id: Ulid,
    pub item_name: String,
    pub booker_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
}

impl BookingView {
    pub fn project(booking: &Booking, item_id: Ulid, item_name: &str) -> Self {
        Self {
            id: booking.id,
            item_id,
            item_name: item_name.to_string(),
            booker_id: booking.booker_id,
            start: booking.window.start,
            end: booking.window.end,
            status: booking.status,
        }
    }
}

/// Minimal booking projection shown on an item's owner view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingSlot {
    pub id: Ulid,
    pub booker_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

impl BookingSlot {
    pub fn project(booking: &Booking) -> Self {
        Self {
            id: booking.id,
            booker_id: booking.booker_id,
            start: booking.window.start,
            end: booking.window.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemView {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub description: String,
    pub available: bool,
    pub request_id: Option<Ulid>,
    /// Populated only on the owner's view of the item.
    pub last_booking: Option<BookingSlot>,
    pub next_booking: Option<BookingSlot>,
    pub comment_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentView {
    pub id: Ulid,
    pub item_id: Ulid,
    pub author_id: Ulid,
    pub author_name: String,
    pub text: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestItemView {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestView {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub description: String,
    pub created_at: Ms,
    /// Items listed in response to this request.
    pub items: Vec<RequestItemView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            booker_id: Ulid::new(),
            window: Window::new(start, end),
            status,
        }
    }

    fn item_with(bookings: Vec<Booking>) -> ItemState {
        let mut item = ItemState::new(
            Ulid::new(),
            Ulid::new(),
            "drill".into(),
            "cordless".into(),
            true,
            None,
        );
        for b in bookings {
            item.insert_booking(b);
        }
        item
    }

    #[test]
    fn window_basics() {
        let w = Window::new(100, 200);
        assert_eq!(w.duration_ms(), 100);
        assert!(w.contains_instant(100));
        assert!(w.contains_instant(199));
        assert!(!w.contains_instant(200)); // half-open
    }

    #[test]
    fn window_past_future_boundaries() {
        let w = Window::new(100, 200);
        assert!(w.is_past(201));
        assert!(!w.is_past(200)); // end == now is not yet past
        assert!(w.is_future(99));
        assert!(!w.is_future(100)); // start == now is not future
    }

    #[test]
    fn booking_ordering() {
        let item = item_with(vec![
            booking(300, 400, BookingStatus::Waiting),
            booking(100, 200, BookingStatus::Waiting),
            booking(200, 300, BookingStatus::Waiting),
        ]);
        assert_eq!(item.bookings[0].window.start, 100);
        assert_eq!(item.bookings[1].window.start, 200);
        assert_eq!(item.bookings[2].window.start, 300);
    }

    #[test]
    fn state_filter_parses_known_spellings() {
        assert_eq!(StateFilter::parse("ALL"), Some(StateFilter::All));
        assert_eq!(StateFilter::parse("CURRENT"), Some(StateFilter::Current));
        assert_eq!(StateFilter::parse("PAST"), Some(StateFilter::Past));
        assert_eq!(StateFilter::parse("FUTURE"), Some(StateFilter::Future));
        assert_eq!(StateFilter::parse("WAITING"), Some(StateFilter::Waiting));
        assert_eq!(StateFilter::parse("REJECTED"), Some(StateFilter::Rejected));
    }

    #[test]
    fn state_filter_rejects_unknown_spellings() {
        assert_eq!(StateFilter::parse("all"), None); // case-sensitive wire spelling
        assert_eq!(StateFilter::parse("CANCELED"), None);
        assert_eq!(StateFilter::parse("APPROVED"), None);
        assert_eq!(StateFilter::parse(""), None);
    }

    #[test]
    fn temporal_filters_partition_at_fixed_now() {
        let now = 1000;
        let past = booking(100, 900, BookingStatus::Approved);
        let current = booking(900, 1100, BookingStatus::Approved);
        let future = booking(1100, 1200, BookingStatus::Approved);

        for b in [&past, &current, &future] {
            let hits = [
                StateFilter::Current.admits(b, now),
                StateFilter::Past.admits(b, now),
                StateFilter::Future.admits(b, now),
            ];
            assert_eq!(hits.iter().filter(|h| **h).count(), 1, "{b:?}");
            assert!(StateFilter::All.admits(b, now));
        }
        assert!(StateFilter::Past.admits(&past, now));
        assert!(StateFilter::Current.admits(&current, now));
        assert!(StateFilter::Future.admits(&future, now));
    }

    #[test]
    fn status_filters_ignore_time() {
        let now = 1000;
        let waiting = booking(100, 900, BookingStatus::Waiting);
        let rejected = booking(1100, 1200, BookingStatus::Rejected);
        assert!(StateFilter::Waiting.admits(&waiting, now));
        assert!(!StateFilter::Waiting.admits(&rejected, now));
        assert!(StateFilter::Rejected.admits(&rejected, now));
        assert!(!StateFilter::Rejected.admits(&waiting, now));
    }

    #[test]
    fn last_booking_picks_latest_started_approved() {
        let item = item_with(vec![
            booking(100, 200, BookingStatus::Approved),
            booking(300, 400, BookingStatus::Approved),
            booking(500, 600, BookingStatus::Waiting), // started but not approved
            booking(2000, 3000, BookingStatus::Approved), // not started yet
        ]);
        let last = item.last_booking(1000).unwrap();
        assert_eq!(last.window.start, 300);
    }

    #[test]
    fn next_booking_picks_earliest_upcoming_approved() {
        let item = item_with(vec![
            booking(100, 200, BookingStatus::Approved),
            booking(1500, 1600, BookingStatus::Rejected), // upcoming but rejected
            booking(2000, 3000, BookingStatus::Approved),
            booking(4000, 5000, BookingStatus::Approved),
        ]);
        let next = item.next_booking(1000).unwrap();
        assert_eq!(next.window.start, 2000);
    }

    #[test]
    fn last_next_on_empty_item() {
        let item = item_with(vec![]);
        assert!(item.last_booking(1000).is_none());
        assert!(item.next_booking(1000).is_none());
    }

    #[test]
    fn booking_starting_exactly_now_counts_as_last() {
        let item = item_with(vec![booking(1000, 2000, BookingStatus::Approved)]);
        assert!(item.last_booking(1000).is_some());
        assert!(item.next_booking(1000).is_none());
    }

    #[test]
    fn has_completed_requires_ended_window() {
        let booker = Ulid::new();
        let mut item = item_with(vec![]);
        item.insert_booking(Booking {
            id: Ulid::new(),
            booker_id: booker,
            window: Window::new(100, 900),
            status: BookingStatus::Rejected, // status is irrelevant
        });
        item.insert_booking(Booking {
            id: Ulid::new(),
            booker_id: booker,
            window: Window::new(1000, 2000),
            status: BookingStatus::Approved,
        });

        assert!(item.has_completed(booker, 1000));
        assert!(!item.has_completed(booker, 900)); // end == now is not completed
        assert!(!item.has_completed(Ulid::new(), 1000)); // someone else
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingRequested {
            id: Ulid::new(),
            item_id: Ulid::new(),
            booker_id: Ulid::new(),
            window: Window::new(1000, 2000),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
