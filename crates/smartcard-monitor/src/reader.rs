//! Reader and token objects.

use crate::monitor::ReaderSnapshot;
use daemon_registry::{DaemonObject, Handle, ObjectCore, Registry};
use std::any::Any;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// A card present in a reader. Created on insertion, killed on removal.
pub struct Token {
    core: ObjectCore,
    reader_name: String,
}

impl Token {
    fn create(registry: &Registry, reader: &Reader) -> Arc<Self> {
        let token = registry.register(|handle| {
            Arc::new(Self {
                core: ObjectCore::new(handle),
                reader_name: reader.name().to_string(),
            })
        });
        let _ = registry.adopt(reader.handle(), token.handle());
        token
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }
}

impl DaemonObject for Token {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct ReaderState {
    present: bool,
    token: Option<Arc<Token>>,
}

/// One physically attached card reader.
///
/// State is updated from smartcard-layer polls; transitions of the
/// card-present flag create and kill the [`Token`] member.
pub struct Reader {
    core: ObjectCore,
    name: String,
    state: Mutex<ReaderState>,
}

impl Reader {
    /// Wrap a newly observed reader.
    pub fn create(registry: &Registry, name: &str) -> Arc<Self> {
        let reader = registry.register(|handle| {
            Arc::new(Self {
                core: ObjectCore::new(handle),
                name: name.to_string(),
                state: Mutex::new(ReaderState {
                    present: false,
                    token: None,
                }),
            })
        });
        info!(reader = name, "token reader inserted into system");
        reader
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a card is currently present.
    pub fn has_token(&self) -> bool {
        self.state.lock().unwrap().token.is_some()
    }

    /// The current token, if a card is inserted.
    pub fn token(&self) -> Option<Arc<Token>> {
        self.state.lock().unwrap().token.clone()
    }

    /// Apply a state snapshot: card appearing creates a token, card
    /// vanishing kills it.
    pub fn update(&self, registry: &Registry, snapshot: &ReaderSnapshot) {
        let mut state = self.state.lock().unwrap();
        let was_present = state.present;
        state.present = snapshot.present;

        if snapshot.present && !was_present {
            debug_assert!(state.token.is_none());
            let token = Token::create(registry, self);
            debug!(reader = %self.name, token = %token.handle(), "token inserted");
            state.token = Some(token);
        } else if !snapshot.present && was_present {
            if let Some(token) = state.token.take() {
                debug!(reader = %self.name, token = %token.handle(), "token removed");
                drop(state); // kill cascade takes the object tree locks
                registry.kill(token.handle());
            }
        }
    }
}

impl DaemonObject for Reader {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn on_kill(&self) {
        // The token child (if any) is already dead; drop our reference.
        self.state.lock().unwrap().token = None;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
