use crate::error::StoreError;
use crate::state::{Message, MessageId, MessageStatus};

/// Outcome of a successful [`MessageStore::replace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Replaced {
    InPlace,
    /// The new id was already present elsewhere; that copy was folded into this slot.
    Collapsed,
}

/// Ordered messages of the open conversation. New entries are appended; replacements keep
/// their slot. Ids are unique across the whole store.
#[derive(Debug, Default)]
pub(crate) struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub(crate) fn insert(&mut self, message: Message) -> Result<(), StoreError> {
        if self.contains(&message.id) {
            return Err(StoreError::DuplicateId(message.id));
        }
        self.messages.push(message);
        Ok(())
    }

    pub(crate) fn replace(
        &mut self,
        old_id: &MessageId,
        updated: Message,
    ) -> Result<Replaced, StoreError> {
        let Some(pos) = self.position(old_id) else {
            return Err(StoreError::NotFound(old_id.clone()));
        };
        let dup = if &updated.id != old_id {
            self.position(&updated.id)
        } else {
            None
        };
        self.messages[pos] = updated;
        match dup {
            Some(dup) => {
                self.messages.remove(dup);
                Ok(Replaced::Collapsed)
            }
            None => Ok(Replaced::InPlace),
        }
    }

    pub(crate) fn update_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(m) => {
                m.status = status;
                true
            }
            None => {
                tracing::debug!(%id, "update_status: message not in store");
                false
            }
        }
    }

    pub(crate) fn find(&self, mut predicate: impl FnMut(&Message) -> bool) -> Option<&Message> {
        self.messages.iter().find(|m| predicate(m))
    }

    pub(crate) fn get(&self, id: &MessageId) -> Option<&Message> {
        self.find(|m| &m.id == id)
    }

    pub(crate) fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub(crate) fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}
