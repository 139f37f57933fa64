//! The host process's own buffer, seen as a peer.
//!
//! The local buffer reports state changes through a callback invoked from
//! inside its own locks, on whatever thread touched the buffer. Calling the
//! controller from there could deadlock against the driver, so the callback
//! only folds the update into [`LocalSlot`] under a leaf lock. The registry
//! drains the slot from the driver before each remote update and once at
//! controller shutdown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use profbudget_core::id::Timestamp;
use profbudget_core::update::UpdateMessage;
use profbudget_mem::sink::EvictionSink;

/// Callback receiving the local buffer's updates.
pub type UpdateCallback = Box<dyn Fn(UpdateMessage) + Send + Sync>;

/// In-process buffer manager.
pub trait LocalSource: Send + Sync {
    /// Install a callback, or remove it with `None`.
    ///
    /// Implementations may synchronously call the replaced callback with
    /// `Final`; the slot ignores that once it is detached.
    fn set_update_callback(&self, callback: Option<UpdateCallback>);

    /// Destroy released chunks done at or before `at`. Best-effort.
    fn destroy_at_or_before(&self, at: Timestamp);
}

#[derive(Debug, Default)]
struct SlotState {
    /// A controller is listening.
    attached: bool,
    /// The local buffer sent `Final`; reported once by `drain`.
    lost: bool,
    pending: UpdateMessage,
}

/// What the driver found in the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drained {
    Nothing,
    Update(UpdateMessage),
    /// The local buffer is gone for good.
    Lost,
}

/// Pending local update plus controller presence, behind one leaf lock.
///
/// The lock is held only to copy or merge fields, never while calling out.
#[derive(Debug, Clone, Default)]
pub struct LocalSlot {
    inner: Arc<Mutex<SlotState>>,
}

impl LocalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // Plain data inside; a panic elsewhere cannot leave it half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callback body: merge `update` into the pending slot.
    pub fn fold_local(&self, update: UpdateMessage) {
        debug_assert!(!update.is_not_update(), "local callback given a non-update");
        let mut st = self.lock();
        if !st.attached {
            return;
        }
        if update.is_final() {
            st.attached = false;
            st.lost = true;
            st.pending.clear();
            return;
        }
        st.pending.fold(update);
    }

    /// Take whatever is pending.
    pub fn drain(&self) -> Drained {
        let mut st = self.lock();
        if st.lost {
            st.lost = false;
            return Drained::Lost;
        }
        match st.pending.take() {
            UpdateMessage::NotAnUpdate => Drained::Nothing,
            update => Drained::Update(update),
        }
    }

    pub fn attach(&self) {
        let mut st = self.lock();
        st.attached = true;
        st.lost = false;
        st.pending.clear();
    }

    /// Stop accepting updates. Returns whether the slot was attached, i.e.
    /// whether the local buffer still holds our callback.
    pub fn detach(&self) -> bool {
        let mut st = self.lock();
        st.pending.clear();
        st.lost = false;
        std::mem::replace(&mut st.attached, false)
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    /// Callback that folds into this slot.
    pub fn callback(&self) -> UpdateCallback {
        let slot = self.clone();
        Box::new(move |update| slot.fold_local(update))
    }
}

/// Eviction of the host's own chunks: a direct call into the local buffer.
#[derive(Clone)]
pub struct LocalEviction {
    source: Arc<dyn LocalSource>,
}

impl LocalEviction {
    pub fn new(source: Arc<dyn LocalSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn LocalSource> {
        &self.source
    }
}

impl EvictionSink for LocalEviction {
    fn destroy_at_or_before(&self, at: Timestamp) {
        self.source.destroy_at_or_before(at);
    }
}

/// Local buffer stand-in that records eviction requests.
///
/// Updates are pushed with [`RecordingLocalSource::emit`], which calls the
/// installed callback while holding the source's own lock, the same way a
/// real buffer manager reports from inside its critical section.
#[derive(Default)]
pub struct RecordingLocalSource {
    callback: Mutex<Option<UpdateCallback>>,
    destroyed: Mutex<Vec<Timestamp>>,
}

impl RecordingLocalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, update: UpdateMessage) {
        let cb = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cb) = cb.as_ref() {
            cb(update);
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn destroyed(&self) -> Vec<Timestamp> {
        self.destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LocalSource for RecordingLocalSource {
    fn set_update_callback(&self, callback: Option<UpdateCallback>) {
        let previous = {
            let mut cb = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *cb, callback)
        };
        // The replaced listener learns that this source is done with it.
        if let Some(previous) = previous {
            previous(UpdateMessage::Final);
        }
    }

    fn destroy_at_or_before(&self, at: Timestamp) {
        self.destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(at);
    }
}
