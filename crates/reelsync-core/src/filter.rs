//! Batch filters applied to received messages before dispatch.

use crate::message::{FieldValue, Message, MessageKind};

/// Transforms a batch of messages that arrived together.
pub trait MessageFilter {
    fn filter(&self, batch: Vec<Message>) -> Vec<Message>;
}

/// Keeps only the latest message of one kind in a batch.
///
/// With match attributes, two messages are duplicates only if every listed
/// field is equal, so a parameter drag on one effect does not swallow a
/// change to another.
#[derive(Debug, Clone)]
pub struct RemoveDuplicateMessagesFilter {
    kind: MessageKind,
    match_attributes: Vec<String>,
}

impl RemoveDuplicateMessagesFilter {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            match_attributes: Vec::new(),
        }
    }

    pub fn matching(kind: MessageKind, attributes: &[&str]) -> Self {
        Self {
            kind,
            match_attributes: attributes.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl MessageFilter for RemoveDuplicateMessagesFilter {
    fn filter(&self, batch: Vec<Message>) -> Vec<Message> {
        let mut seen: Vec<Vec<Option<FieldValue>>> = Vec::new();
        let mut kept = Vec::with_capacity(batch.len());
        for message in batch.into_iter().rev() {
            if message.kind() != self.kind {
                kept.push(message);
                continue;
            }
            let key: Vec<_> = self
                .match_attributes
                .iter()
                .map(|attribute| message.field(attribute))
                .collect();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            kept.push(message);
        }
        kept.reverse();
        kept
    }
}

/// Run filters in registration order. Single-message batches pass untouched.
pub fn apply_filters(filters: &[Box<dyn MessageFilter>], batch: Vec<Message>) -> Vec<Message> {
    filters.iter().fold(batch, |batch, filter| {
        if batch.len() > 1 { filter.filter(batch) } else { batch }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::Guid;
    use crate::message::{Payload, Target};
    use serde_json::json;

    fn parameter(entity: &str, parameter: &str, value: f64) -> Message {
        Message::new(
            "c-1",
            Target::Broadcast,
            Payload::SetEffectParameter {
                entity: Guid::from(entity),
                parameter: parameter.into(),
                value: json!(value),
            },
        )
    }

    #[test]
    fn parameter_drag_collapses_to_last() {
        let filter = RemoveDuplicateMessagesFilter::matching(MessageKind::SetEffectParameter, &["entity"]);
        let batch: Vec<_> = (0..5).map(|i| parameter("fx-1", "gain", i as f64)).collect();
        let kept = filter.filter(batch);
        assert_eq!(kept, vec![parameter("fx-1", "gain", 4.0)]);
    }

    #[test]
    fn different_entities_are_not_duplicates() {
        let filter =
            RemoveDuplicateMessagesFilter::matching(MessageKind::SetEffectParameter, &["entity", "parameter"]);
        let batch = vec![
            parameter("fx-1", "gain", 1.0),
            parameter("fx-2", "gain", 1.0),
            parameter("fx-1", "pan", 0.1),
            parameter("fx-1", "gain", 2.0),
        ];
        let kept = filter.filter(batch);
        assert_eq!(
            kept,
            vec![
                parameter("fx-2", "gain", 1.0),
                parameter("fx-1", "pan", 0.1),
                parameter("fx-1", "gain", 2.0),
            ]
        );
    }

    #[test]
    fn without_attributes_keeps_latest_of_kind_only() {
        let filter = RemoveDuplicateMessagesFilter::new(MessageKind::NumberOfPeers);
        let peers = |n| Message::new("server", Target::Broadcast, Payload::NumberOfPeers { content: n });
        let ping = Message::new("server", Target::Broadcast, Payload::Ping {});
        let kept = filter.filter(vec![peers(1), ping.clone(), peers(2), peers(3)]);
        assert_eq!(kept, vec![ping, peers(3)]);
    }

    #[test]
    fn filters_skip_single_message_batches() {
        struct DropAll;
        impl MessageFilter for DropAll {
            fn filter(&self, _batch: Vec<Message>) -> Vec<Message> {
                Vec::new()
            }
        }
        let filters: Vec<Box<dyn MessageFilter>> = vec![Box::new(DropAll)];
        let single = vec![parameter("fx", "gain", 1.0)];
        assert_eq!(apply_filters(&filters, single.clone()), single);
        assert!(apply_filters(&filters, vec![parameter("a", "b", 1.0), parameter("c", "d", 2.0)]).is_empty());
    }
}
