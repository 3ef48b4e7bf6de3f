use ulid::Ulid;

use crate::model::*;

use super::access::{check_party, now_ms};
use super::classify::page_bookings;
use super::{Engine, EngineError};

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.require_user(id)
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    // ── Items ────────────────────────────────────────────────

    /// Single item view. The booking slots are the owner's privilege;
    /// everyone else sees the catalog fields and comments only.
    pub async fn item_view(&self, acting_user: Ulid, id: Ulid) -> Result<ItemView, EngineError> {
        let rs = self.get_item(&id).ok_or(EngineError::ItemNotFound(id))?;
        let guard = rs.read().await;
        let now = now_ms();
        let is_owner = guard.owner_id == acting_user;
        Ok(ItemView {
            id: guard.id,
            owner_id: guard.owner_id,
            name: guard.name.clone(),
            description: guard.description.clone(),
            available: guard.available,
            request_id: guard.request_id,
            last_booking: is_owner
                .then(|| guard.last_booking(now).map(BookingSlot::project))
                .flatten(),
            next_booking: is_owner
                .then(|| guard.next_booking(now).map(BookingSlot::project))
                .flatten(),
            comment_count: guard.comments.len(),
        })
    }

    /// The owner's catalog: their items in creation order, with the
    /// owner-view booking slots.
    pub async fn items_by_owner(
        &self,
        owner_id: Ulid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ItemView>, EngineError> {
        self.require_user(owner_id)?;
        // The owner index is append-only, so its order is creation order.
        let ids = self
            .owner_items
            .get(&owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let now = now_ms();
        let mut views = Vec::new();
        for id in ids.into_iter().skip(offset).take(limit) {
            let Some(rs) = self.get_item(&id) else { continue };
            let guard = rs.read().await;
            views.push(ItemView {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
                description: guard.description.clone(),
                available: guard.available,
                request_id: guard.request_id,
                last_booking: guard.last_booking(now).map(BookingSlot::project),
                next_booking: guard.next_booking(now).map(BookingSlot::project),
                comment_count: guard.comments.len(),
            });
        }
        Ok(views)
    }

    /// Free-text catalog search: case-insensitive substring on name or
    /// description, available items only. A blank query matches nothing.
    pub async fn search_items(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Vec<ItemView> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut ids: Vec<Ulid> = self.items.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut views = Vec::new();
        for id in ids {
            let Some(rs) = self.get_item(&id) else { continue };
            let guard = rs.read().await;
            if !guard.available {
                continue;
            }
            if !guard.name.to_lowercase().contains(&needle)
                && !guard.description.to_lowercase().contains(&needle)
            {
                continue;
            }
            views.push(ItemView {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
                description: guard.description.clone(),
                available: guard.available,
                request_id: guard.request_id,
                last_booking: None,
                next_booking: None,
                comment_count: guard.comments.len(),
            });
        }
        views.into_iter().skip(offset).take(limit).collect()
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Single booking view, visible to its booker and the item's owner.
    pub async fn get_booking(
        &self,
        acting_user: Ulid,
        booking_id: Ulid,
    ) -> Result<BookingView, EngineError> {
        let item_id = self
            .item_of_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let rs = self
            .get_item(&item_id)
            .ok_or(EngineError::ItemNotFound(item_id))?;
        let guard = rs.read().await;
        let booking = guard
            .booking(booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        check_party(acting_user, booking, guard.owner_id)?;
        Ok(BookingView::project(booking, item_id, &guard.name))
    }

    /// Bookings made by `subject`, classified by `state` against a single
    /// evaluation instant, newest window first.
    pub async fn bookings_for_booker(
        &self,
        subject: Ulid,
        state: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<BookingView>, EngineError> {
        let state = StateFilter::parse(state)
            .ok_or_else(|| EngineError::UnknownState(state.to_string()))?;
        self.require_user(subject)?;

        let ids = self
            .booker_bookings
            .get(&subject)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let now = now_ms();
        let mut rows = Vec::with_capacity(ids.len());
        for booking_id in ids {
            let Some(item_id) = self.item_of_booking(&booking_id) else {
                continue;
            };
            let Some(rs) = self.get_item(&item_id) else { continue };
            let guard = rs.read().await;
            if let Some(booking) = guard.booking(booking_id) {
                rows.push((booking.clone(), item_id, guard.name.clone()));
            }
        }
        Ok(page_bookings(rows, state, now, offset, limit))
    }

    /// Bookings on any item owned by `subject`, same classification.
    pub async fn bookings_for_owner(
        &self,
        subject: Ulid,
        state: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<BookingView>, EngineError> {
        let state = StateFilter::parse(state)
            .ok_or_else(|| EngineError::UnknownState(state.to_string()))?;
        self.require_user(subject)?;

        let item_ids = self
            .owner_items
            .get(&subject)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let now = now_ms();
        let mut rows = Vec::new();
        for item_id in item_ids {
            let Some(rs) = self.get_item(&item_id) else { continue };
            let guard = rs.read().await;
            for booking in &guard.bookings {
                rows.push((booking.clone(), item_id, guard.name.clone()));
            }
        }
        Ok(page_bookings(rows, state, now, offset, limit))
    }

    /// True iff `user` has any booking of `item` that ended before now,
    /// regardless of status. The comment gate.
    pub async fn has_completed_booking(&self, user_id: Ulid, item_id: Ulid) -> bool {
        let Some(rs) = self.get_item(&item_id) else {
            return false;
        };
        let guard = rs.read().await;
        guard.has_completed(user_id, now_ms())
    }

    // ── Comments ─────────────────────────────────────────────

    pub async fn comments_for_item(&self, item_id: Ulid) -> Result<Vec<CommentView>, EngineError> {
        let rs = self
            .get_item(&item_id)
            .ok_or(EngineError::ItemNotFound(item_id))?;
        let guard = rs.read().await;
        Ok(guard
            .comments
            .iter()
            .map(|c| CommentView {
                id: c.id,
                item_id,
                author_id: c.author_id,
                author_name: self
                    .users
                    .get(&c.author_id)
                    .map(|u| u.name.clone())
                    .unwrap_or_default(),
                text: c.text.clone(),
                created_at: c.created_at,
            })
            .collect())
    }

    // ── Item requests ────────────────────────────────────────

    pub async fn request_view(
        &self,
        acting_user: Ulid,
        request_id: Ulid,
    ) -> Result<RequestView, EngineError> {
        self.require_user(acting_user)?;
        let request = self
            .requests
            .get(&request_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::RequestNotFound(request_id))?;
        let items = self.items_for_request(request_id).await;
        Ok(RequestView {
            id: request.id,
            requester_id: request.requester_id,
            description: request.description,
            created_at: request.created_at,
            items,
        })
    }

    /// The caller's own want-ads, newest first.
    pub async fn requests_by_user(
        &self,
        acting_user: Ulid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RequestView>, EngineError> {
        self.require_user(acting_user)?;
        self.collect_requests(|r| r.requester_id == acting_user, offset, limit)
            .await
    }

    /// Everyone else's want-ads, newest first: the browse feed.
    pub async fn all_requests(
        &self,
        acting_user: Ulid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RequestView>, EngineError> {
        self.require_user(acting_user)?;
        self.collect_requests(|r| r.requester_id != acting_user, offset, limit)
            .await
    }

    async fn collect_requests(
        &self,
        keep: impl Fn(&ItemRequest) -> bool,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RequestView>, EngineError> {
        let mut requests: Vec<ItemRequest> = self
            .requests
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let mut views = Vec::new();
        for request in requests.into_iter().skip(offset).take(limit) {
            let items = self.items_for_request(request.id).await;
            views.push(RequestView {
                id: request.id,
                requester_id: request.requester_id,
                description: request.description,
                created_at: request.created_at,
                items,
            });
        }
        Ok(views)
    }

    pub async fn items_for_request(&self, request_id: Ulid) -> Vec<RequestItemView> {
        let ids = self
            .request_items
            .get(&request_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(rs) = self.get_item(&id) else { continue };
            let guard = rs.read().await;
            items.push(RequestItemView {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
            });
        }
        items
    }
}
