//! Pull-based resolution of a service name into candidates.
//!
//! An iterator starts `Empty`. The first pull fills it from the first directory that returns
//! a usable member list, then hands out candidates one at a time in the order the directory
//! listed them:
//!
//! ```text
//! Empty --next--> Filling --(n > 0)--> Ready --cursor == n--> Exhausted
//!                         \--(n == 0 or error)--------------> Exhausted
//! reset: any state but Closed -> Empty        close: any state -> Closed
//! ```

use std::sync::Arc;

use log::debug;

use crate::client::ClientInner;
use crate::error::Result;
use crate::types::{Candidate, RequestOptions};

/// Generic open/next/reset/close contract for service iteration.
pub trait ServiceIterator {
    type Item;

    /// Next item, or `None` once exhausted.
    fn next_item(&mut self) -> Result<Option<Self::Item>>;

    /// Forgets everything fetched; the next pull fetches again.
    fn reset(&mut self);

    /// Releases storage. Safe in every state.
    fn close(&mut self);

    /// Number of items handed out since the last fill.
    fn cursor(&self) -> usize;
}

/// Where a [`CandidateIterator`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Empty,
    Filling,
    Ready,
    Exhausted,
    Closed,
}

/// Candidates fetched by one fill.
#[derive(Debug, Default)]
struct IterationState {
    candidates: Vec<Candidate>,
    cursor: usize,
    filled: bool,
}

impl IterationState {
    fn take_next(&mut self) -> Option<Candidate> {
        let candidate = self.candidates.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(candidate)
    }
}

/// Iterates the live candidates of one service.
///
/// Obtained from [`DiscoveryClient::open`](crate::DiscoveryClient::open). Owned by its caller
/// and never shared.
pub struct CandidateIterator {
    client: Arc<ClientInner>,
    service: String,
    options: RequestOptions,
    state: IteratorState,
    storage: Option<IterationState>,
}

impl CandidateIterator {
    pub(crate) fn new(client: Arc<ClientInner>, service: String, options: RequestOptions) -> Self {
        CandidateIterator {
            client,
            service,
            options,
            state: IteratorState::Empty,
            storage: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    /// Candidates of the current fill, empty before the first pull.
    pub fn candidates(&self) -> &[Candidate] {
        self.storage
            .as_ref()
            .map(|s| s.candidates.as_slice())
            .unwrap_or_default()
    }

    fn fill(&mut self) -> Result<()> {
        self.state = IteratorState::Filling;
        match self.client.fetch_members(&self.service, &self.options) {
            Ok(candidates) => {
                debug!(
                    "Filled {} with {} candidate(s)",
                    self.service,
                    candidates.len()
                );
                self.state = if candidates.is_empty() {
                    IteratorState::Exhausted
                } else {
                    IteratorState::Ready
                };
                self.storage = Some(IterationState {
                    candidates,
                    cursor: 0,
                    filled: true,
                });
                Ok(())
            }
            Err(e) => {
                self.storage = None;
                self.state = IteratorState::Exhausted;
                Err(e)
            }
        }
    }
}

impl ServiceIterator for CandidateIterator {
    type Item = Candidate;

    fn next_item(&mut self) -> Result<Option<Candidate>> {
        match self.state {
            IteratorState::Closed | IteratorState::Exhausted => return Ok(None),
            IteratorState::Empty | IteratorState::Filling => self.fill()?,
            IteratorState::Ready => {}
        }

        let next = match self.storage.as_mut() {
            Some(storage) if storage.filled => storage.take_next(),
            _ => None,
        };
        if next.is_none() {
            self.state = IteratorState::Exhausted;
        }
        Ok(next)
    }

    fn reset(&mut self) {
        if self.state == IteratorState::Closed {
            return;
        }
        debug!("Resetting iterator for {}", self.service);
        self.storage = None;
        self.state = IteratorState::Empty;
    }

    fn close(&mut self) {
        self.storage = None;
        self.state = IteratorState::Closed;
    }

    fn cursor(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.cursor)
    }
}

impl Iterator for CandidateIterator {
    type Item = Result<Candidate>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}
