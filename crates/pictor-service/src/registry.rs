use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::types::{LoadEvent, ProgressUpdate, ResourcePayload};

/// Identifies one caller's interest in an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallerId(u64);

/// A caller waiting on an operation: its event channel and delivery flags.
pub(crate) struct CallerSlot {
    id: CallerId,
    sender: mpsc::UnboundedSender<LoadEvent>,
    wants_progress: bool,
}

/// In-flight fetch state for one cache key.
///
/// Owned exclusively by the registry; created on the first miss for a key and
/// removed when it completes or the last caller detaches.
struct Operation {
    /// Attached callers in delivery order. High-priority joiners sit at the
    /// front.
    callers: Vec<CallerSlot>,
    /// Fires once no caller remains interested.
    cancel: CancellationToken,
    /// Whether the transfer was started with progressive reporting.
    progressive: bool,
}

/// How a caller wants to be attached to an operation.
pub(crate) struct JoinRequest {
    pub sender: mpsc::UnboundedSender<LoadEvent>,
    pub wants_progress: bool,
    pub high_priority: bool,
}

/// Outcome of [`OperationRegistry::join_or_create`].
pub(crate) enum Joined {
    /// Attached to an operation that was already in flight.
    Existing,
    /// A new operation was created. The caller must start the transfer and
    /// observe the returned token for cancellation.
    Created(CancellationToken),
}

/// Tracks the single in-flight fetch per cache key and the callers waiting on
/// it.
///
/// All state transitions for a key happen under one lock, so no two tasks can
/// simultaneously decide to create an operation for the same key. Events are
/// fanned out through per-caller unbounded channels; a slow receiver cannot
/// delay delivery to others.
#[derive(Default)]
pub(crate) struct OperationRegistry {
    operations: Mutex<HashMap<String, Operation>>,
    next_caller_id: AtomicU64,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a caller to the operation for `key`, creating the operation
    /// if none is in flight.
    ///
    /// `progressive` only takes effect on creation; joining an existing
    /// operation never changes its reporting mode.
    pub fn join_or_create(
        &self,
        key: &str,
        join: JoinRequest,
        progressive: bool,
    ) -> (CallerId, Joined) {
        let id = CallerId(self.next_caller_id.fetch_add(1, Ordering::Relaxed));
        let slot = CallerSlot {
            id,
            sender: join.sender,
            wants_progress: join.wants_progress,
        };

        let mut operations = self.operations.lock().unwrap();
        match operations.get_mut(key) {
            Some(operation) => {
                tracing::trace!(key, "Joining in-flight operation");
                if join.high_priority {
                    operation.callers.insert(0, slot);
                } else {
                    operation.callers.push(slot);
                }
                (id, Joined::Existing)
            }
            None => {
                tracing::trace!(key, "Creating operation");
                let cancel = CancellationToken::new();
                operations.insert(
                    key.to_owned(),
                    Operation {
                        callers: vec![slot],
                        cancel: cancel.clone(),
                        progressive,
                    },
                );
                (id, Joined::Created(cancel))
            }
        }
    }

    /// Withdraws one caller's interest without affecting others.
    ///
    /// The caller receives no further events. When the last caller detaches
    /// the operation is removed and its transfer cancelled.
    pub fn detach(&self, key: &str, caller: CallerId) {
        let mut operations = self.operations.lock().unwrap();
        let Some(operation) = operations.get_mut(key) else {
            return;
        };

        operation.callers.retain(|slot| slot.id != caller);
        if operation.callers.is_empty() {
            tracing::trace!(key, "Last caller detached, cancelling transfer");
            if let Some(operation) = operations.remove(key) {
                operation.cancel.cancel();
            }
        }
    }

    /// Fans a non-terminal transfer slice out to every attached caller that
    /// asked for progress.
    pub fn report_progress(&self, key: &str, update: ProgressUpdate) {
        let senders: Vec<_> = {
            let operations = self.operations.lock().unwrap();
            let Some(operation) = operations.get(key) else {
                return;
            };
            if !operation.progressive {
                return;
            }
            operation
                .callers
                .iter()
                .filter(|slot| slot.wants_progress)
                .map(|slot| slot.sender.clone())
                .collect()
        };

        for sender in senders {
            sender.send(LoadEvent::Progress(update.clone())).ok();
        }
    }

    /// Terminal delivery: removes the operation and fans the result out to
    /// every caller still attached.
    ///
    /// Completing a key with no operation (already detached or cancelled) is
    /// a no-op.
    pub fn complete(&self, key: &str, result: Result<ResourcePayload, FetchError>) {
        let Some(operation) = self.operations.lock().unwrap().remove(key) else {
            return;
        };

        for slot in operation.callers {
            slot.sender.send(LoadEvent::Done(result.clone())).ok();
        }
    }

    /// Cancels every in-flight operation.
    ///
    /// Each still-attached caller receives a terminal cancellation
    /// acknowledgement.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = {
            let mut operations = self.operations.lock().unwrap();
            operations.drain().collect()
        };

        for (key, operation) in drained {
            tracing::trace!(key, "Cancelling operation");
            operation.cancel.cancel();
            for slot in operation.callers {
                slot.sender.send(LoadEvent::Done(Err(FetchError::Cancelled))).ok();
            }
        }
    }

    /// Whether any operation is in flight.
    pub fn is_running(&self) -> bool {
        !self.operations.lock().unwrap().is_empty()
    }

    /// Number of in-flight operations.
    pub fn running_count(&self) -> usize {
        self.operations.lock().unwrap().len()
    }
}

struct Attachment {
    registry: Arc<OperationRegistry>,
    key: String,
    caller: CallerId,
}

/// One request's view of a load: the receiving end of its event channel plus
/// the means to withdraw interest.
///
/// Dropping the handle before the terminal event detaches the caller, so
/// abandoned requests cannot keep an operation's caller list growing.
pub struct LoadHandle {
    events: mpsc::UnboundedReceiver<LoadEvent>,
    attachment: Option<Attachment>,
    finished: bool,
}

impl LoadHandle {
    /// A handle attached to an in-flight operation.
    pub(crate) fn attached(
        events: mpsc::UnboundedReceiver<LoadEvent>,
        registry: Arc<OperationRegistry>,
        key: String,
        caller: CallerId,
    ) -> Self {
        Self {
            events,
            attachment: Some(Attachment {
                registry,
                key,
                caller,
            }),
            finished: false,
        }
    }

    /// A handle whose outcome is already determined (cache hit, ledger hit,
    /// policy rejection); its channel is pre-loaded with the events.
    pub(crate) fn settled(events: mpsc::UnboundedReceiver<LoadEvent>) -> Self {
        Self {
            events,
            attachment: None,
            finished: false,
        }
    }

    /// Receives the next event.
    ///
    /// Returns `None` once the terminal event has been received or the handle
    /// was cancelled.
    pub async fn next_event(&mut self) -> Option<LoadEvent> {
        if self.finished {
            return None;
        }

        let event = self.events.recv().await;
        match event {
            Some(LoadEvent::Done(_)) | None => {
                self.finished = true;
                self.attachment = None;
            }
            _ => {}
        }
        event
    }

    /// Awaits the terminal event, discarding non-terminal ones.
    pub async fn finish(mut self) -> Result<ResourcePayload, FetchError> {
        while let Some(event) = self.next_event().await {
            if let LoadEvent::Done(result) = event {
                return result;
            }
        }
        Err(FetchError::Cancelled)
    }

    /// Withdraws this caller's interest.
    ///
    /// No further events are delivered, including the terminal one. The
    /// transfer keeps running as long as other callers remain attached.
    pub fn cancel(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.registry.detach(&attachment.key, attachment.caller);
        }
        self.finished = true;
        self.events.close();
    }
}

impl Drop for LoadHandle {
    fn drop(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.registry.detach(&attachment.key, attachment.caller);
        }
    }
}
