//! Message tree operations over a loaded [`Chat`].
//!
//! A chat stores its messages unordered, linked through `prev_id`/`next_ids`.
//! The *visible path* is obtained by starting at the first stored message and
//! repeatedly following the first child (in `next_ids` order) whose
//! `is_shown` flag is set. Creating a message never clears the flag on its
//! siblings, so more than one sibling can be shown at once; the scan order then
//! decides which branch is visible.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Chat, Message, MessageDraft};

/// Appends a new shown node and links it under its parent.
///
/// Returns `None` without touching the chat when the parent does not exist,
/// or when `prev_id` is `None` but the chat already has a root.
pub fn create_message(chat: &mut Chat, draft: MessageDraft) -> Option<String> {
    match draft.prev_id.as_deref() {
        Some(prev_id) if !chat.contains(prev_id) => {
            warn!(chat_id = %chat.id, prev_id, "parent message not found; nothing created");
            return None;
        }
        None if !chat.messages.is_empty() => {
            warn!(chat_id = %chat.id, "chat already has a root; nothing created");
            return None;
        }
        _ => {}
    }

    let id = fresh_id(chat);
    if let Some(parent) = draft.prev_id.as_deref().and_then(|p| chat.find_mut(p)) {
        parent.next_ids.push(id.clone());
    }
    debug!(chat_id = %chat.id, message_id = %id, role = %draft.role, "message created");
    chat.messages.push(Message::from_draft(id.clone(), draft));
    Some(id)
}

fn fresh_id(chat: &Chat) -> String {
    loop {
        let id = Uuid::new_v4().to_string();
        let taken = chat
            .messages
            .iter()
            .any(|m| m.id == id || m.next_ids.iter().any(|n| *n == id));
        if !taken {
            return id;
        }
    }
}

/// Hides `from_id` and shows `to_id`. Both must exist; otherwise nothing changes.
///
/// Whether the two are siblings is not checked.
pub fn switch_branch(chat: &mut Chat, from_id: &str, to_id: &str) -> bool {
    if !chat.contains(from_id) || !chat.contains(to_id) {
        warn!(chat_id = %chat.id, from_id, to_id, "branch switch skipped: message missing");
        return false;
    }
    for message in chat.messages.iter_mut() {
        if message.id == from_id {
            message.is_shown = false;
        }
        if message.id == to_id {
            message.is_shown = true;
        }
    }
    true
}

/// Removes a message and every reference to it.
///
/// The removed node's own children are left stored but are no longer reachable
/// from the root.
pub fn delete_message(chat: &mut Chat, id: &str) -> bool {
    if !chat.contains(id) {
        return false;
    }
    chat.messages.retain(|m| m.id != id);
    for message in chat.messages.iter_mut() {
        message.next_ids.retain(|n| n != id);
    }
    debug!(chat_id = %chat.id, message_id = id, "message deleted");
    true
}

/// The visible transcript: first stored message, then first shown child, and so on.
///
/// Stops at a node with no shown child, or before revisiting a node if the
/// stored links form a cycle.
pub fn linearize(chat: &Chat) -> Vec<Message> {
    let Some(root) = chat.messages.first() else {
        return Vec::new();
    };

    let mut index: HashMap<&str, &Message> = HashMap::with_capacity(chat.messages.len());
    for message in &chat.messages {
        index.entry(message.id.as_str()).or_insert(message);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut path = Vec::new();
    let mut current = root;
    loop {
        seen.insert(current.id.as_str());
        path.push(current.clone());

        let next = current
            .next_ids
            .iter()
            .filter_map(|id| index.get(id.as_str()).copied())
            .find(|m| m.is_shown);

        match next {
            Some(next) if seen.contains(next.id.as_str()) => {
                warn!(chat_id = %chat.id, message_id = %next.id, "cycle in message links; path truncated");
                break;
            }
            Some(next) => current = next,
            None => break,
        }
    }
    path
}

/// Siblings of a message (its parent's `next_ids`) and its position among them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alternatives {
    pub siblings: Vec<String>,
    pub position: usize,
}

pub fn alternatives(chat: &Chat, id: &str) -> Option<Alternatives> {
    let message = chat.find(id)?;
    let parent = message.prev_id.as_deref().and_then(|p| chat.find(p));
    match parent {
        Some(parent) => {
            let position = parent.next_ids.iter().position(|n| n == id)?;
            Some(Alternatives { siblings: parent.next_ids.clone(), position })
        }
        None => Some(Alternatives { siblings: vec![id.to_string()], position: 0 }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchDirection {
    Previous,
    Next,
}

/// Shows the neighbouring sibling of `id` instead of `id`. Returns the newly shown id.
pub fn shift_branch(chat: &mut Chat, id: &str, direction: BranchDirection) -> Option<String> {
    let alts = alternatives(chat, id)?;
    let target = match direction {
        BranchDirection::Previous => alts.position.checked_sub(1)?,
        BranchDirection::Next => alts.position + 1,
    };
    let target = alts.siblings.get(target)?.clone();
    switch_branch(chat, id, &target).then_some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn ids(path: &[Message]) -> Vec<&str> {
        path.iter().map(|m| m.id.as_str()).collect()
    }

    fn chat_with_reply() -> (Chat, String, String) {
        let mut chat = Chat::new();
        let a = create_message(&mut chat, MessageDraft::user(None, "hi", vec![])).unwrap();
        let b = create_message(
            &mut chat,
            MessageDraft::assistant(Some(a.clone()), "hello", Some("llama3.2".into())),
        )
        .unwrap();
        (chat, a, b)
    }

    #[test]
    fn reply_is_linked_and_visible() {
        let (chat, a, b) = chat_with_reply();
        assert_eq!(ids(&linearize(&chat)), vec![a.as_str(), b.as_str()]);
        let parent = chat.find(&a).unwrap();
        assert_eq!(parent.next_ids.iter().filter(|n| **n == b).count(), 1);
        assert_eq!(chat.find(&b).unwrap().llm_model_name.as_deref(), Some("llama3.2"));
    }

    #[test]
    fn regenerated_sibling_becomes_visible_after_switch() {
        let (mut chat, a, b) = chat_with_reply();
        let c = create_message(&mut chat, MessageDraft::assistant(Some(a.clone()), "hey", None)).unwrap();

        // Both siblings are shown; the first in scan order wins.
        assert_eq!(ids(&linearize(&chat)), vec![a.as_str(), b.as_str()]);

        assert!(switch_branch(&mut chat, &b, &c));
        assert_eq!(ids(&linearize(&chat)), vec![a.as_str(), c.as_str()]);
        assert!(!chat.find(&b).unwrap().is_shown);
        assert!(chat.find(&c).unwrap().is_shown);
    }

    #[test]
    fn missing_parent_or_second_root_creates_nothing() {
        let (mut chat, _, _) = chat_with_reply();
        let before = chat.clone();
        assert!(create_message(&mut chat, MessageDraft::user(Some("nope".into()), "x", vec![])).is_none());
        assert!(create_message(&mut chat, MessageDraft::user(None, "x", vec![])).is_none());
        assert_eq!(chat, before);
    }

    #[test]
    fn switch_requires_both_ends() {
        let (mut chat, a, _) = chat_with_reply();
        let before = chat.clone();
        assert!(!switch_branch(&mut chat, &a, "missing"));
        assert_eq!(chat, before);
    }

    #[test]
    fn delete_leaf_unlinks_it() {
        let (mut chat, a, b) = chat_with_reply();
        assert!(delete_message(&mut chat, &b));
        assert!(!chat.contains(&b));
        assert!(chat.find(&a).unwrap().next_ids.is_empty());
        assert_eq!(ids(&linearize(&chat)), vec![a.as_str()]);
    }

    #[test]
    fn delete_leaves_descendants_stored_but_unreachable() {
        let (mut chat, a, b) = chat_with_reply();
        let c = create_message(&mut chat, MessageDraft::user(Some(b.clone()), "more", vec![])).unwrap();

        assert!(delete_message(&mut chat, &b));
        let orphan = chat.find(&c).expect("descendant stays stored");
        assert_eq!(orphan.prev_id.as_deref(), Some(b.as_str()));
        assert!(chat.messages.iter().all(|m| !m.next_ids.contains(&b)));
        assert_eq!(ids(&linearize(&chat)), vec![a.as_str()]);
    }

    #[test]
    fn linearize_terminates_on_cycles() {
        let (mut chat, a, b) = chat_with_reply();
        chat.find_mut(&b).unwrap().next_ids.push(a.clone());
        let path = linearize(&chat);
        assert_eq!(ids(&path), vec![a.as_str(), b.as_str()]);

        chat.find_mut(&a).unwrap().next_ids.push(a.clone());
        chat.find_mut(&b).unwrap().is_shown = false;
        assert_eq!(ids(&linearize(&chat)), vec![a.as_str()]);
    }

    #[test]
    fn linearize_skips_dangling_child_ids() {
        let (mut chat, a, b) = chat_with_reply();
        chat.find_mut(&a).unwrap().next_ids.insert(0, "ghost".into());
        assert_eq!(ids(&linearize(&chat)), vec![a.as_str(), b.as_str()]);
        assert!(linearize(&Chat::new()).is_empty());
    }

    #[test]
    fn shift_walks_siblings_in_creation_order() {
        let (mut chat, a, b) = chat_with_reply();
        let c = create_message(&mut chat, MessageDraft::assistant(Some(a.clone()), "alt", None)).unwrap();
        switch_branch(&mut chat, &b, &c);

        let alts = alternatives(&chat, &c).unwrap();
        assert_eq!(alts.siblings, vec![b.clone(), c.clone()]);
        assert_eq!(alts.position, 1);

        assert_eq!(shift_branch(&mut chat, &c, BranchDirection::Next), None);
        assert_eq!(shift_branch(&mut chat, &c, BranchDirection::Previous), Some(b.clone()));
        assert_eq!(ids(&linearize(&chat)), vec![a.as_str(), b.as_str()]);

        let root = alternatives(&chat, &a).unwrap();
        assert_eq!(root, Alternatives { siblings: vec![a.clone()], position: 0 });
        assert_eq!(chat.find(&a).unwrap().role, Role::User);
    }
}
