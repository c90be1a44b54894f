//! An ordered window of room events with relation aggregation.
//!
//! The timeline indexes annotated, edited and replied-to events by the
//! target event ID and relation type. Display resolution collapses
//! `m.replace` edits into the event shown to the user.

use std::collections::HashMap;

use serde_json::Value;
use weft_types::Event;

/// Ordered event window for one room.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    /// Room this timeline belongs to.
    pub room_id: String,
    events: Vec<Event>,
    /// `event_id -> relation type -> related events`. Holds event values,
    /// never references, so the index creates no cycles.
    aggregated: HashMap<String, HashMap<String, Vec<Event>>>,
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new(room_id: impl Into<String>) -> Self {
        Self { room_id: room_id.into(), ..Self::default() }
    }

    /// Number of events in the window.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in insertion order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Insert an event, indexing its relation if it carries one.
    pub fn add_event(&mut self, event: Event) {
        if let (Some(rel_type), Some(target)) =
            (event.relationship_type(), event.relationship_event_id())
        {
            let (rel_type, target) = (rel_type.to_string(), target.to_string());
            let related = self
                .aggregated
                .entry(target)
                .or_default()
                .entry(rel_type)
                .or_default();
            // Re-delivery of the same event replaces the indexed copy.
            related.retain(|existing| existing.event_id != event.event_id);
            related.push(event.clone());
        }
        self.events.retain(|existing| existing.event_id != event.event_id);
        self.events.push(event);
    }

    /// A previously observed event, by ID.
    pub fn get_event_by_id(&self, event_id: &str) -> Option<&Event> {
        self.events.iter().find(|event| event.event_id == event_id)
    }

    /// Events related to `event_id` with the given relation type.
    pub fn aggregated_events(&self, event_id: &str, relation_type: &str) -> &[Event] {
        self.aggregated
            .get(event_id)
            .and_then(|by_type| by_type.get(relation_type))
            .map_or(&[], Vec::as_slice)
    }

    /// Apply a redaction to the timeline copy of its target event and drop
    /// the target's aggregation index.
    pub fn apply_redaction(&mut self, redaction: &Event) {
        let Some(redacts) = redaction.content.get("redacts").and_then(Value::as_str) else {
            return;
        };
        let redacts = redacts.to_string();
        for event in &mut self.events {
            if event.event_id == redacts {
                event.set_redaction_event(redaction);
            }
        }
        self.aggregated.remove(&redacts);
    }

    /// Resolve the event to display for `event`, collapsing `m.replace`
    /// edits.
    ///
    /// Only edits authored by the original sender and of type
    /// `m.room.message` count; the latest edit by sort order wins, and its
    /// `m.new_content` replaces the displayed content.
    pub fn resolve_display_event(&self, event: &Event) -> Event {
        let mut edits: Vec<&Event> = self
            .aggregated_events(&event.event_id, "m.replace")
            .iter()
            .filter(|edit| {
                edit.sender_id == event.sender_id && edit.event_type == "m.room.message"
            })
            .collect();
        edits.sort_by(|a, b| {
            a.sort_order.partial_cmp(&b.sort_order).unwrap_or(std::cmp::Ordering::Equal)
        });
        let Some(latest) = edits.last() else {
            return event.clone();
        };

        let mut display = event.clone();
        if let Some(new_content) = latest.content.get("m.new_content").filter(|v| v.is_object()) {
            display.content = new_content.clone();
        }
        display
    }
}
