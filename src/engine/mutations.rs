use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::{check_owner, now_ms, validate_window_at};
use super::{Engine, EngineError, WalCommand};

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Engine {
    // ── User directory ───────────────────────────────────────

    pub async fn create_user(
        &self,
        id: Ulid,
        name: String,
        email: String,
    ) -> Result<User, EngineError> {
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if name.trim().is_empty() {
            return Err(EngineError::BlankField("name"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        if !email.contains('@') {
            return Err(EngineError::InvalidEmail(email));
        }
        if self.emails.contains_key(&email) {
            return Err(EngineError::EmailTaken(email));
        }

        let event = Event::UserCreated {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        self.wal_append(&event).await?;
        let user = User { id, name, email };
        self.emails.insert(user.email.clone(), id);
        self.users.insert(id, user.clone());
        Ok(user)
    }

    /// Partial update. Blank fields in the patch are ignored, matching the
    /// catalog's PATCH semantics.
    pub async fn update_user(
        &self,
        id: Ulid,
        name: Option<String>,
        email: Option<String>,
    ) -> Result<User, EngineError> {
        let current = self.require_user(id)?;

        let name = non_blank(name);
        let email = non_blank(email);
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("user name too long"));
            }
        if let Some(ref e) = email {
            if e.len() > MAX_EMAIL_LEN {
                return Err(EngineError::LimitExceeded("email too long"));
            }
            if !e.contains('@') {
                return Err(EngineError::InvalidEmail(e.clone()));
            }
            if let Some(holder) = self.emails.get(e)
                && *holder.value() != id {
                    return Err(EngineError::EmailTaken(e.clone()));
                }
        }

        let event = Event::UserUpdated {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        self.wal_append(&event).await?;

        let mut updated = current;
        if let Some(n) = name {
            updated.name = n;
        }
        if let Some(e) = email {
            self.emails.remove(&updated.email);
            self.emails.insert(e.clone(), id);
            updated.email = e;
        }
        self.users.insert(id, updated.clone());
        Ok(updated)
    }

    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let user = self.require_user(id)?;
        if self
            .owner_items
            .get(&id)
            .is_some_and(|items| !items.is_empty())
        {
            return Err(EngineError::OwnsItems(id));
        }

        let event = Event::UserDeleted { id };
        self.wal_append(&event).await?;
        self.emails.remove(&user.email);
        self.users.remove(&id);
        Ok(())
    }

    // ── Item catalog ─────────────────────────────────────────

    pub async fn create_item(
        &self,
        id: Ulid,
        owner_id: Ulid,
        name: String,
        description: String,
        available: bool,
        request_id: Option<Ulid>,
    ) -> Result<ItemView, EngineError> {
        self.require_user(owner_id)?;
        if let Some(rid) = request_id
            && !self.requests.contains_key(&rid) {
                return Err(EngineError::RequestNotFound(rid));
            }
        if name.trim().is_empty() {
            return Err(EngineError::BlankField("name"));
        }
        if description.trim().is_empty() {
            return Err(EngineError::BlankField("description"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("item name too long"));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if self
            .owner_items
            .get(&owner_id)
            .is_some_and(|items| items.len() >= MAX_ITEMS_PER_OWNER)
        {
            return Err(EngineError::LimitExceeded("too many items for owner"));
        }

        let event = Event::ItemCreated {
            id,
            owner_id,
            name: name.clone(),
            description: description.clone(),
            available,
            request_id,
        };
        self.wal_append(&event).await?;
        let rs = ItemState::new(id, owner_id, name, description, available, request_id);
        let view = ItemView {
            id,
            owner_id,
            name: rs.name.clone(),
            description: rs.description.clone(),
            available,
            request_id,
            last_booking: None,
            next_booking: None,
            comment_count: 0,
        };
        self.items.insert(id, Arc::new(RwLock::new(rs)));
        self.owner_items.entry(owner_id).or_default().push(id);
        if let Some(rid) = request_id {
            self.request_items.entry(rid).or_default().push(id);
        }
        Ok(view)
    }

    /// Partial update by the owner. Blank name/description patches are
    /// ignored rather than rejected.
    pub async fn update_item(
        &self,
        acting_user: Ulid,
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        available: Option<bool>,
    ) -> Result<ItemView, EngineError> {
        let rs = self.get_item(&id).ok_or(EngineError::ItemNotFound(id))?;
        let mut guard = rs.write().await;
        check_owner(acting_user, &guard)?;

        let name = non_blank(name);
        let description = non_blank(description);
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("item name too long"));
            }
        if let Some(ref d) = description
            && d.len() > MAX_DESCRIPTION_LEN {
                return Err(EngineError::LimitExceeded("description too long"));
            }

        let event = Event::ItemUpdated {
            id,
            name,
            description,
            available,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let now = now_ms();
        Ok(ItemView {
            id,
            owner_id: guard.owner_id,
            name: guard.name.clone(),
            description: guard.description.clone(),
            available: guard.available,
            request_id: guard.request_id,
            last_booking: guard.last_booking(now).map(BookingSlot::project),
            next_booking: guard.next_booking(now).map(BookingSlot::project),
            comment_count: guard.comments.len(),
        })
    }

    // ── Booking lifecycle ────────────────────────────────────

    /// Open a reservation. Precondition order: booker exists, item exists,
    /// item available, booker is not the owner, window is chronological and
    /// not in the past. Created `Waiting`; overlapping reservations are
    /// not rejected, only the availability flag gates.
    pub async fn create_booking(
        &self,
        id: Ulid,
        booker_id: Ulid,
        item_id: Ulid,
        window: Window,
    ) -> Result<BookingView, EngineError> {
        self.require_user(booker_id)?;
        let rs = self
            .get_item(&item_id)
            .ok_or(EngineError::ItemNotFound(item_id))?;
        let mut guard = rs.write().await;

        if !guard.available {
            return Err(EngineError::ItemUnavailable(item_id));
        }
        if guard.owner_id == booker_id {
            return Err(EngineError::OwnItemBooking(item_id));
        }
        validate_window_at(&window, now_ms())?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many bookings on item"));
        }

        let event = Event::BookingRequested {
            id,
            item_id,
            booker_id,
            window,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let booking = guard
            .booking(id)
            .expect("booking just applied under the item lock");
        Ok(BookingView::project(booking, item_id, &guard.name))
    }

    /// One-shot approval or rejection by the item's owner. The `Waiting`
    /// re-check runs under the item's write lock, so two racing decisions
    /// cannot both succeed.
    pub async fn decide_booking(
        &self,
        acting_user: Ulid,
        booking_id: Ulid,
        approve: bool,
    ) -> Result<BookingView, EngineError> {
        let (item_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        check_owner(acting_user, &guard)?;

        let booking = guard
            .booking(booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if booking.status != BookingStatus::Waiting {
            return Err(EngineError::AlreadyDecided {
                booking_id,
                status: booking.status,
            });
        }

        let event = Event::BookingDecided {
            id: booking_id,
            item_id,
            approved: approve,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let booking = guard
            .booking(booking_id)
            .expect("booking still present under the item lock");
        Ok(BookingView::project(booking, item_id, &guard.name))
    }

    // ── Comments ─────────────────────────────────────────────

    /// Renters may comment only after a completed reservation of the item.
    pub async fn add_comment(
        &self,
        id: Ulid,
        item_id: Ulid,
        author_id: Ulid,
        text: String,
    ) -> Result<CommentView, EngineError> {
        let author = self.require_user(author_id)?;
        let rs = self
            .get_item(&item_id)
            .ok_or(EngineError::ItemNotFound(item_id))?;
        let mut guard = rs.write().await;

        let now = now_ms();
        if !guard.has_completed(author_id, now) {
            return Err(EngineError::CommentNotEligible {
                user_id: author_id,
                item_id,
            });
        }
        if text.trim().is_empty() {
            return Err(EngineError::BlankField("text"));
        }
        if text.len() > MAX_COMMENT_LEN {
            return Err(EngineError::LimitExceeded("comment too long"));
        }
        if guard.comments.len() >= MAX_COMMENTS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many comments on item"));
        }

        let event = Event::CommentAdded {
            id,
            item_id,
            author_id,
            text: text.clone(),
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        Ok(CommentView {
            id,
            item_id,
            author_id,
            author_name: author.name,
            text,
            created_at: now,
        })
    }

    // ── Item requests ────────────────────────────────────────

    pub async fn create_request(
        &self,
        id: Ulid,
        requester_id: Ulid,
        description: String,
    ) -> Result<RequestView, EngineError> {
        self.require_user(requester_id)?;
        if description.trim().is_empty() {
            return Err(EngineError::BlankField("description"));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if self.requests.len() >= MAX_REQUESTS {
            return Err(EngineError::LimitExceeded("too many requests"));
        }

        let created_at = now_ms();
        let event = Event::RequestCreated {
            id,
            requester_id,
            description: description.clone(),
            created_at,
        };
        self.wal_append(&event).await?;
        self.requests.insert(
            id,
            ItemRequest {
                id,
                requester_id,
                description: description.clone(),
                created_at,
            },
        );
        Ok(RequestView {
            id,
            requester_id,
            description,
            created_at,
            items: Vec::new(),
        })
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.users.iter() {
            let user = entry.value();
            events.push(Event::UserCreated {
                id: user.id,
                name: user.name.clone(),
                email: user.email.clone(),
            });
        }

        for entry in self.requests.iter() {
            let request = entry.value();
            events.push(Event::RequestCreated {
                id: request.id,
                requester_id: request.requester_id,
                description: request.description.clone(),
                created_at: request.created_at,
            });
        }

        // Sorted so the owner index's creation order survives replay
        let mut item_ids: Vec<Ulid> = self.items.iter().map(|e| *e.key()).collect();
        item_ids.sort();
        for id in item_ids {
            let entry = match self.items.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let rs = entry.value().clone();
            drop(entry);
            let guard = rs.read().await;

            events.push(Event::ItemCreated {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
                description: guard.description.clone(),
                available: guard.available,
                request_id: guard.request_id,
            });
            for booking in &guard.bookings {
                events.push(Event::BookingRequested {
                    id: booking.id,
                    item_id: guard.id,
                    booker_id: booking.booker_id,
                    window: booking.window,
                });
                match booking.status {
                    BookingStatus::Waiting => {}
                    BookingStatus::Approved => events.push(Event::BookingDecided {
                        id: booking.id,
                        item_id: guard.id,
                        approved: true,
                    }),
                    BookingStatus::Rejected => events.push(Event::BookingDecided {
                        id: booking.id,
                        item_id: guard.id,
                        approved: false,
                    }),
                }
            }
            for comment in &guard.comments {
                events.push(Event::CommentAdded {
                    id: comment.id,
                    item_id: guard.id,
                    author_id: comment.author_id,
                    text: comment.text.clone(),
                    created_at: comment.created_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
