use ulid::Ulid;

use crate::model::BookingStatus;

/// How an error maps onto the boundary's status taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A referenced identifier does not exist.
    NotFound,
    /// Malformed input: unparseable state filter, non-chronological window.
    Validation,
    /// A business rule said no. Never retried automatically.
    Conflict,
    /// Unexpected internal failure; the only kind worth retrying.
    Fault,
}

#[derive(Debug)]
pub enum EngineError {
    UserNotFound(Ulid),
    ItemNotFound(Ulid),
    BookingNotFound(Ulid),
    RequestNotFound(Ulid),
    InvalidWindow { start: i64, end: i64 },
    WindowInPast { start: i64, now: i64 },
    UnknownState(String),
    InvalidEmail(String),
    BlankField(&'static str),
    LimitExceeded(&'static str),
    EmailTaken(String),
    ItemUnavailable(Ulid),
    OwnItemBooking(Ulid),
    NotOwner { user_id: Ulid, item_id: Ulid },
    NotParty { user_id: Ulid, booking_id: Ulid },
    AlreadyDecided { booking_id: Ulid, status: BookingStatus },
    OwnsItems(Ulid),
    CommentNotEligible { user_id: Ulid, item_id: Ulid },
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UserNotFound(_)
            | EngineError::ItemNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::RequestNotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidWindow { .. }
            | EngineError::WindowInPast { .. }
            | EngineError::UnknownState(_)
            | EngineError::InvalidEmail(_)
            | EngineError::BlankField(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::EmailTaken(_)
            | EngineError::ItemUnavailable(_)
            | EngineError::OwnItemBooking(_)
            | EngineError::NotOwner { .. }
            | EngineError::NotParty { .. }
            | EngineError::AlreadyDecided { .. }
            | EngineError::OwnsItems(_)
            | EngineError::CommentNotEligible { .. } => ErrorKind::Conflict,
            EngineError::WalError(_) => ErrorKind::Fault,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::ItemNotFound(id) => write!(f, "item not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::RequestNotFound(id) => write!(f, "request not found: {id}"),
            EngineError::InvalidWindow { start, end } => {
                write!(f, "window [{start}, {end}) is not chronological")
            }
            EngineError::WindowInPast { start, now } => {
                write!(f, "window start {start} is in the past (now: {now})")
            }
            EngineError::UnknownState(s) => write!(f, "Unknown state: {s}"),
            EngineError::InvalidEmail(email) => write!(f, "not an email address: {email}"),
            EngineError::BlankField(field) => write!(f, "{field} must not be blank"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::EmailTaken(email) => write!(f, "email already registered: {email}"),
            EngineError::ItemUnavailable(id) => {
                write!(f, "item {id} is not available for booking")
            }
            EngineError::OwnItemBooking(id) => {
                write!(f, "owner cannot book own item {id}")
            }
            EngineError::NotOwner { user_id, item_id } => {
                write!(f, "user {user_id} is not the owner of item {item_id}")
            }
            EngineError::NotParty { user_id, booking_id } => {
                write!(f, "user {user_id} is not a party to booking {booking_id}")
            }
            EngineError::AlreadyDecided { booking_id, status } => {
                write!(f, "booking {booking_id} is already {status}")
            }
            EngineError::OwnsItems(id) => {
                write!(f, "cannot delete user {id}: still owns items")
            }
            EngineError::CommentNotEligible { user_id, item_id } => {
                write!(
                    f,
                    "user {user_id} has no completed booking of item {item_id}"
                )
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
