use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{envelope::Conversation, error::RegistryError};

/// Server-wide store of conversations.
///
/// Conversations are never removed, so a nickname or id handed out once stays
/// valid for the life of the process. Every method holds the lock for its
/// whole duration, and callers only ever see clones.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Conversations>,
}

#[derive(Default)]
struct Conversations {
    ordered: Vec<Conversation>,
    by_nickname: HashMap<String, usize>,
    ids: HashSet<Uuid>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation. An empty nickname falls back to the number of
    /// conversations that already exist.
    pub async fn create(&self, nickname: &str) -> Result<Conversation, RegistryError> {
        let mut conversations = self.inner.lock().await;

        let nickname = match nickname.trim() {
            "" => conversations.ordered.len().to_string(),
            given => given.to_string(),
        };

        if conversations.by_nickname.contains_key(&nickname) {
            return Err(RegistryError::DuplicateNickname(nickname));
        }

        let mut id = Uuid::new_v4();
        while conversations.ids.contains(&id) {
            id = Uuid::new_v4();
        }

        let conversation = Conversation { id, nickname };
        let index = conversations.ordered.len();
        conversations
            .by_nickname
            .insert(conversation.nickname.clone(), index);
        conversations.ids.insert(id);
        conversations.ordered.push(conversation.clone());

        Ok(conversation)
    }

    /// Finds a conversation by nickname, trimmed the same way
    /// [`Registry::create`] trims it.
    pub async fn lookup_by_nickname(&self, nickname: &str) -> Result<Conversation, RegistryError> {
        let nickname = nickname.trim();
        let conversations = self.inner.lock().await;
        conversations
            .by_nickname
            .get(nickname)
            .map(|&index| conversations.ordered[index].clone())
            .ok_or_else(|| RegistryError::NotFound(nickname.to_string()))
    }

    /// Snapshot of every conversation in creation order.
    pub async fn list(&self) -> Vec<Conversation> {
        self.inner.lock().await.ordered.clone()
    }
}
