//! Event feed for the indexing and UI layers.
//!
//! ```rust,ignore
//! let events = engine.subscribe();
//! std::thread::spawn(move || {
//!     while let Ok(event) = events.recv() {
//!         println!("{event:?}");
//!     }
//! });
//! ```

use crate::moves::MoveState;
use crate::types::{DocumentId, MoveId, RootId};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// Something observers may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A document was loaded into memory.
    DocumentOpened {
        /// The document.
        document_id: DocumentId,
    },
    /// An open document integrated new updates from disk.
    DocumentChanged {
        /// The document.
        document_id: DocumentId,
    },
    /// A document unknown to this instance was discovered and registered.
    DocumentImported {
        /// The document.
        document_id: DocumentId,
        /// Root it was registered under.
        root_id: RootId,
    },
    /// A document's root assignment changed.
    DocumentMoved {
        /// The document.
        document_id: DocumentId,
        /// Previous root.
        from: RootId,
        /// New root.
        to: RootId,
    },
    /// A move owned by this instance reached a new state.
    MoveStateChanged {
        /// The move.
        move_id: MoveId,
        /// State reached.
        state: MoveState,
    },
    /// A move is stuck and needs an operator decision.
    MoveNeedsAttention {
        /// The move.
        move_id: MoveId,
        /// Why it was surfaced.
        reason: String,
    },
}

/// Fan-out of engine events to subscribers.
///
/// Events are delivered in emission order. Subscribers whose receiver was
/// dropped are removed on the next emit.
#[derive(Debug, Default)]
pub struct EventFeed {
    subscribers: RwLock<Vec<Sender<EngineEvent>>>,
}

impl EventFeed {
    /// Creates a feed without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to all subscribers.
    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
