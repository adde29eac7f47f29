use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::FetchError;

/// The result of fetching one identifier.
#[derive(Debug)]
pub enum Outcome {
    Success(Bytes),
    Failure(FetchError),
}

impl Outcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Fetched bytes, if the fetch succeeded.
    #[inline]
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            Self::Success(data) => Some(data),
            Self::Failure(_) => None,
        }
    }

    /// Fetch failure, if any.
    #[inline]
    pub fn failure(&self) -> Option<&FetchError> {
        match self {
            Self::Success(_) => None,
            Self::Failure(error) => Some(error),
        }
    }

    #[inline]
    pub fn into_result(self) -> Result<Bytes, FetchError> {
        self.into()
    }
}

impl From<Result<Bytes, FetchError>> for Outcome {
    #[inline]
    fn from(result: Result<Bytes, FetchError>) -> Self {
        match result {
            Ok(data) => Self::Success(data),
            Err(error) => Self::Failure(error),
        }
    }
}

impl From<Outcome> for Result<Bytes, FetchError> {
    #[inline]
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(data) => Ok(data),
            Outcome::Failure(error) => Err(error),
        }
    }
}

#[derive(Debug)]
struct Slots {
    outcomes: Vec<Option<Outcome>>,
    /// Number of slots still waiting for an outcome.
    pending: usize,
}

/// Index-addressed outcome storage shared by the workers of a pool.
///
/// Writing a slot and counting it down happen within the same critical section, so that the pending count always matches the
/// number of empty slots. The write bringing the pending count down to zero wakes up whoever awaits [`ResultStore::completed()`].
#[derive(Debug)]
pub struct ResultStore {
    slots: Mutex<Slots>,
    done: Notify,
}

impl ResultStore {
    /// Create a store with `len` empty slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                outcomes: std::iter::repeat_with(|| None).take(len).collect(),
                pending: len,
            }),
            done: Notify::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().outcomes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots still waiting for an outcome.
    #[inline]
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Store `outcome` in slot `index` and count it down.
    ///
    /// Each slot can only be filled once: out of range indexes and already filled slots are left untouched,
    /// in which case `false` is returned and the pending count is not decremented.
    pub fn complete(&self, index: usize, outcome: Outcome) -> bool {
        let mut slots = self.lock();

        match slots.outcomes.get_mut(index) {
            Some(slot) if slot.is_none() => *slot = Some(outcome),
            _ => {
                tracing::warn!("Rejecting outcome for slot {index}: slot is out of range or already filled");
                return false;
            }
        }

        slots.pending -= 1; // one pending count per empty slot

        if slots.pending == 0 {
            drop(slots);

            // a permit is stored if nobody is waiting yet
            self.done.notify_one();
        }

        true
    }

    /// Wait for every slot to be filled.
    ///
    /// Only one task is expected to wait on a given store.
    pub async fn completed(&self) {
        if self.pending() > 0 {
            self.done.notified().await;
        }
    }

    /// Take every outcome out of the store, in slot order.
    ///
    /// Returns `None` while any slot is still pending, leaving the store untouched.
    pub fn take(&self) -> Option<Vec<Outcome>> {
        let mut slots = self.lock();

        if slots.pending > 0 {
            return None;
        }

        std::mem::take(&mut slots.outcomes).into_iter().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // slots are never left half-written, so a poisoned lock is still consistent
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
