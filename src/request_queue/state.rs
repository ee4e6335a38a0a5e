//! In-memory queue state shared by the local backends.
//!
//! Pure data structure, no I/O: the memory backend uses it directly, the
//! file backend mirrors its transitions to disk. Every transition keeps
//! the single-membership invariant: an identifier lives in at most one of
//! {pending, in-progress, handled}.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;

use super::{AddRequestResult, QueueError};
use crate::request::Request;

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// All requests ever added, keyed by identifier
    pub requests: HashMap<String, Request>,
    /// Pending identifiers in dispatch order
    pub pending: VecDeque<String>,
    pub in_progress: HashSet<String>,
    pub handled: HashSet<String>,
}

impl QueueState {
    pub fn add(&mut self, request: Request, forefront: bool) -> AddRequestResult {
        let id = request.id.clone();
        if self.requests.contains_key(&id) {
            return AddRequestResult {
                was_already_handled: self.handled.contains(&id),
                was_already_present: true,
                request_id: id,
            };
        }

        self.requests.insert(id.clone(), request);
        if forefront {
            self.pending.push_front(id.clone());
        } else {
            self.pending.push_back(id.clone());
        }
        AddRequestResult {
            request_id: id,
            was_already_present: false,
            was_already_handled: false,
        }
    }

    pub fn fetch_next(&mut self) -> Option<Request> {
        let id = self.pending.pop_front()?;
        self.in_progress.insert(id.clone());
        // pending ids always have a backing request
        self.requests.get(&id).cloned()
    }

    pub fn mark_handled(&mut self, request: &Request) -> Result<(), QueueError> {
        if !self.requests.contains_key(&request.id) {
            return Err(QueueError::UnknownRequest(request.id.clone()));
        }
        if !self.in_progress.remove(&request.id) {
            return Err(QueueError::NotInProgress(request.id.clone()));
        }
        self.handled.insert(request.id.clone());
        let mut stored = request.clone();
        if stored.handled_at.is_none() {
            stored.handled_at = Some(Utc::now());
        }
        self.requests.insert(stored.id.clone(), stored);
        Ok(())
    }

    pub fn reclaim(&mut self, request: &Request, forefront: bool) -> Result<(), QueueError> {
        if !self.requests.contains_key(&request.id) {
            return Err(QueueError::UnknownRequest(request.id.clone()));
        }
        if !self.in_progress.remove(&request.id) {
            return Err(QueueError::NotInProgress(request.id.clone()));
        }
        self.requests.insert(request.id.clone(), request.clone());
        if forefront {
            self.pending.push_front(request.id.clone());
        } else {
            self.pending.push_back(request.id.clone());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.in_progress.is_empty()
    }

    pub fn handled_count(&self) -> u64 {
        self.handled.len() as u64
    }

    /// Single-membership invariant, asserted by tests.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let pending: HashSet<&String> = self.pending.iter().collect();
        assert_eq!(pending.len(), self.pending.len(), "duplicate pending ids");
        for id in &pending {
            assert!(!self.in_progress.contains(*id));
            assert!(!self.handled.contains(*id));
        }
        for id in &self.in_progress {
            assert!(!self.handled.contains(id));
        }
        for id in self
            .pending
            .iter()
            .chain(self.in_progress.iter())
            .chain(self.handled.iter())
        {
            assert!(self.requests.contains_key(id), "dangling id {id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(n: u32) -> Request {
        Request::new(format!("https://example.com/page/{n}")).unwrap()
    }

    #[test]
    fn add_is_idempotent() {
        let mut state = QueueState::default();
        let first = state.add(request(1), false);
        assert!(!first.was_already_present);

        let second = state.add(request(1), true);
        assert!(second.was_already_present);
        assert!(!second.was_already_handled);
        assert_eq!(first.request_id, second.request_id);
        // The duplicate add with forefront did not change position or count
        assert_eq!(state.pending.len(), 1);
        state.check_invariants();
    }

    #[test]
    fn forefront_goes_first() {
        let mut state = QueueState::default();
        state.add(request(1), false);
        state.add(request(2), false);
        state.add(request(3), true);

        let next = state.fetch_next().unwrap();
        assert_eq!(next.id, request(3).id);
        state.check_invariants();
    }

    #[test]
    fn transitions_enforce_in_progress() {
        let mut state = QueueState::default();
        state.add(request(1), false);
        let req = request(1);

        // Not fetched yet
        assert!(matches!(
            state.mark_handled(&req),
            Err(QueueError::NotInProgress(_))
        ));

        let fetched = state.fetch_next().unwrap();
        state.mark_handled(&fetched).unwrap();

        // Cannot handle twice
        assert!(matches!(
            state.mark_handled(&fetched),
            Err(QueueError::NotInProgress(_))
        ));
        state.check_invariants();
    }

    #[test]
    fn reclaim_updates_stored_request() {
        let mut state = QueueState::default();
        state.add(request(1), false);
        let mut fetched = state.fetch_next().unwrap();
        fetched.retry_count += 1;
        fetched.push_error_message("boom");
        state.reclaim(&fetched, true).unwrap();

        let again = state.fetch_next().unwrap();
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.error_messages, vec!["boom".to_string()]);
        state.check_invariants();
    }

    proptest! {
        /// Any interleaving of adds/fetches/marks/reclaims keeps every id
        /// in exactly one lifecycle state.
        #[test]
        fn membership_stays_single(ops in proptest::collection::vec(0u8..4, 1..200)) {
            let mut state = QueueState::default();
            let mut counter = 0u32;
            let mut open: Vec<Request> = Vec::new();

            for op in ops {
                match op {
                    0 => {
                        counter += 1;
                        state.add(request(counter % 17), counter % 3 == 0);
                    }
                    1 => {
                        if let Some(req) = state.fetch_next() {
                            open.push(req);
                        }
                    }
                    2 => {
                        if let Some(req) = open.pop() {
                            state.mark_handled(&req).unwrap();
                        }
                    }
                    _ => {
                        if let Some(mut req) = open.pop() {
                            req.retry_count += 1;
                            state.reclaim(&req, req.retry_count % 2 == 0).unwrap();
                        }
                    }
                }
                state.check_invariants();
            }
        }
    }
}
