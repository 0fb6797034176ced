//! SQL editor buffer bound to a form field.
//!
//! The form field is what a save or run submits; the editor owns the live
//! text while the page is open and copies it back on submit.

use std::sync::mpsc::{channel, Receiver, Sender};
use tracing::trace;

use crate::routes::ClientRoute;

/// The hidden `sql` textarea the page submits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormField {
    pub value: String,
    pub hidden: bool,
}

impl FormField {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            hidden: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// The buffer was mutated
    DocChanged,
    /// Run/save requested from the editor (Ctrl-Enter)
    Submit,
    /// Formatting requested from the editor (Ctrl-F)
    Format,
}

pub const UNSAVED_CHANGES_WARNING: &str = "You have unsaved changes to your query.";

pub struct EditorHost {
    doc: String,
    changed: bool,
    subscribers: Vec<Sender<EditorEvent>>,
}

impl EditorHost {
    /// Takes over `field`: its value seeds the buffer and the field is hidden.
    pub fn attach(field: &mut FormField) -> Self {
        field.hidden = true;
        Self {
            doc: field.value.clone(),
            changed: false,
            subscribers: Vec::new(),
        }
    }

    /// A new receiver of editor events. Dropped receivers are pruned on the
    /// next emit.
    pub fn subscribe(&mut self) -> Receiver<EditorEvent> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: EditorEvent) {
        trace!(target: "editor", "Emitting {:?}", event);
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn text(&self) -> &str {
        &self.doc
    }

    pub fn is_empty(&self) -> bool {
        self.doc.trim().is_empty()
    }

    /// Length in characters, the unit every offset here uses
    pub fn len(&self) -> usize {
        self.doc.chars().count()
    }

    /// Inserts at a character offset; offsets past the end append.
    pub fn insert(&mut self, offset: usize, text: &str) {
        if text.is_empty() {
            return;
        }
        let at = byte_index(&self.doc, offset);
        self.doc.insert_str(at, text);
        self.mark_changed();
    }

    pub fn replace_all(&mut self, text: &str) {
        if self.doc == text {
            return;
        }
        self.doc = text.to_string();
        self.mark_changed();
    }

    pub fn append_line(&mut self, line: &str) {
        let mut addition = String::new();
        if !self.doc.is_empty() && !self.doc.ends_with('\n') {
            addition.push('\n');
        }
        addition.push_str(line);
        let end = self.len();
        self.insert(end, &addition);
    }

    pub fn clear(&mut self) {
        self.replace_all("");
    }

    fn mark_changed(&mut self) {
        self.changed = true;
        self.emit(EditorEvent::DocChanged);
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_saved(&mut self) {
        self.changed = false;
    }

    /// Copies the buffer into the form field ahead of submission.
    pub fn sync_to_form(&self, field: &mut FormField) {
        field.value = self.doc.clone();
    }

    /// The identifier under or just before `offset`, as used for the schema
    /// tooltip.
    pub fn word_at(&self, offset: usize) -> Option<String> {
        let chars: Vec<char> = self.doc.chars().collect();
        let is_word = |c: char| c.is_alphanumeric() || c == '_';

        let mut pos = offset.min(chars.len());
        if (pos == chars.len() || !is_word(chars[pos])) && pos > 0 && is_word(chars[pos - 1]) {
            pos -= 1;
        }
        if pos >= chars.len() || !is_word(chars[pos]) {
            return None;
        }

        let start = (0..=pos)
            .rev()
            .take_while(|&i| is_word(chars[i]))
            .last()
            .unwrap_or(pos);
        let end = (pos..chars.len())
            .take_while(|&i| is_word(chars[i]))
            .last()
            .map(|i| i + 1)
            .unwrap_or(pos + 1);
        Some(chars[start..end].iter().collect())
    }

    /// Warning to show before leaving the page. Only a saved query's detail
    /// page guards unsaved edits.
    pub fn unsaved_changes_warning(&self, route: ClientRoute) -> Option<&'static str> {
        (route == ClientRoute::QueryDetail && self.changed).then_some(UNSAVED_CHANGES_WARNING)
    }
}

fn byte_index(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_sync() {
        let mut field = FormField::new("select 1");
        let mut editor = EditorHost::attach(&mut field);
        assert!(field.hidden);
        assert_eq!(editor.text(), "select 1");
        assert!(!editor.is_changed());

        editor.replace_all("select 2");
        assert_eq!(field.value, "select 1");
        editor.sync_to_form(&mut field);
        assert_eq!(field.value, "select 2");
    }

    #[test]
    fn test_insert_emits_doc_changed() {
        let mut field = FormField::default();
        let mut editor = EditorHost::attach(&mut field);
        let events = editor.subscribe();

        editor.insert(0, "select * from orders");
        editor.insert(6, " ");
        assert_eq!(editor.text(), "select  * from orders");
        assert!(editor.is_changed());
        assert_eq!(events.try_iter().count(), 2);
    }

    #[test]
    fn test_insert_uses_char_offsets() {
        let mut field = FormField::new("é;");
        let mut editor = EditorHost::attach(&mut field);
        editor.insert(1, "x");
        assert_eq!(editor.text(), "éx;");
        editor.insert(99, "!");
        assert_eq!(editor.text(), "éx;!");
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut field = FormField::default();
        let mut editor = EditorHost::attach(&mut field);
        drop(editor.subscribe());
        let live = editor.subscribe();
        editor.insert(0, "x");
        assert_eq!(editor.subscribers.len(), 1);
        assert_eq!(live.try_recv(), Ok(EditorEvent::DocChanged));
    }

    #[test]
    fn test_word_at() {
        let mut field = FormField::new("select * from auth_user where id = 1");
        let editor = EditorHost::attach(&mut field);
        assert_eq!(editor.word_at(16).as_deref(), Some("auth_user"));
        // Cursor right after the word
        assert_eq!(editor.word_at(23).as_deref(), Some("auth_user"));
        assert_eq!(editor.word_at(7), None);
    }

    #[test]
    fn test_unsaved_warning_only_on_detail() {
        let mut field = FormField::default();
        let mut editor = EditorHost::attach(&mut field);
        assert_eq!(editor.unsaved_changes_warning(ClientRoute::QueryDetail), None);

        editor.insert(0, "select 1");
        assert_eq!(
            editor.unsaved_changes_warning(ClientRoute::QueryDetail),
            Some(UNSAVED_CHANGES_WARNING)
        );
        assert_eq!(editor.unsaved_changes_warning(ClientRoute::Playground), None);

        editor.mark_saved();
        assert_eq!(editor.unsaved_changes_warning(ClientRoute::QueryDetail), None);
    }
}
