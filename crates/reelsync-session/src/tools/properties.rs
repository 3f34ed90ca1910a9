//! Per-entity property tools: one value per entity, last writer wins.

use super::{RemoteChange, Replicated, Update};
use crate::model::{Application, Change, EntityKind, EventKind, ModelEvent};
use reelsync_core::{MessageKind, Payload, RemoveDuplicateMessagesFilter};
use serde_json::json;

/// Which version of a version stack (or versioned clip) is active.
pub struct ActiveVersionSync;

impl Replicated for ActiveVersionSync {
    const NAME: &'static str = "active-version";
    const EVENTS: &'static [EventKind] = &[EventKind::ActiveVersionChanged];
    const MESSAGES: &'static [MessageKind] = &[MessageKind::SetActiveVersion];

    fn outbound(_app: &dyn Application, event: &ModelEvent) -> Option<Payload> {
        match event {
            ModelEvent::ActiveVersionChanged { entity, version } => Some(Payload::SetActiveVersion {
                entity: entity.clone(),
                version: version.clone(),
            }),
            _ => None,
        }
    }

    fn inbound(payload: &Payload) -> Option<RemoteChange> {
        match payload {
            Payload::SetActiveVersion { entity, version } => Some(RemoteChange {
                entity: entity.clone(),
                kinds: &[EntityKind::VersionStack, EntityKind::Clip],
                update: Update::Apply(Change::SetActiveVersion(version.clone())),
            }),
            _ => None,
        }
    }
}

/// Enabled/disabled status of clips, tracks and effects.
pub struct EnabledSync;

impl Replicated for EnabledSync {
    const NAME: &'static str = "enabled";
    const EVENTS: &'static [EventKind] = &[EventKind::EnabledChanged];
    const MESSAGES: &'static [MessageKind] = &[MessageKind::SetEnabled];

    fn outbound(_app: &dyn Application, event: &ModelEvent) -> Option<Payload> {
        match event {
            ModelEvent::EnabledChanged { entity, enabled } => Some(Payload::SetEnabled {
                entity: entity.clone(),
                enabled: *enabled,
            }),
            _ => None,
        }
    }

    fn inbound(payload: &Payload) -> Option<RemoteChange> {
        match payload {
            Payload::SetEnabled { entity, enabled } => Some(RemoteChange {
                entity: entity.clone(),
                kinds: &[EntityKind::Clip, EntityKind::Track, EntityKind::Effect],
                update: Update::Apply(Change::SetEnabled(*enabled)),
            }),
            _ => None,
        }
    }
}

/// In/out range of clips and sequences, sent as `{"start": n, "end": n}`.
pub struct RangeSync;

impl Replicated for RangeSync {
    const NAME: &'static str = "range";
    const EVENTS: &'static [EventKind] = &[EventKind::RangeChanged];
    const MESSAGES: &'static [MessageKind] = &[MessageKind::SetRange];

    fn outbound(_app: &dyn Application, event: &ModelEvent) -> Option<Payload> {
        match event {
            ModelEvent::RangeChanged { entity, start, end } => Some(Payload::SetRange {
                entity: entity.clone(),
                range: json!({ "start": start, "end": end }),
            }),
            _ => None,
        }
    }

    fn inbound(payload: &Payload) -> Option<RemoteChange> {
        let Payload::SetRange { entity, range } = payload else {
            return None;
        };
        let (Some(start), Some(end)) = (range["start"].as_i64(), range["end"].as_i64()) else {
            tracing::warn!(entity = %entity, "malformed range {}", range);
            return None;
        };
        Some(RemoteChange {
            entity: entity.clone(),
            kinds: &[EntityKind::Clip, EntityKind::Sequence],
            update: Update::Apply(Change::SetRange { start, end }),
        })
    }

    fn filters() -> Vec<RemoveDuplicateMessagesFilter> {
        vec![RemoveDuplicateMessagesFilter::matching(MessageKind::SetRange, &["entity"])]
    }
}

/// Effect parameters. Dragging a slider emits a change per frame, so
/// received batches are collapsed per effect and parameter.
pub struct EffectParameterSync;

impl Replicated for EffectParameterSync {
    const NAME: &'static str = "effect-parameter";
    const EVENTS: &'static [EventKind] = &[EventKind::ParameterChanged];
    const MESSAGES: &'static [MessageKind] = &[MessageKind::SetEffectParameter];

    fn outbound(_app: &dyn Application, event: &ModelEvent) -> Option<Payload> {
        match event {
            ModelEvent::ParameterChanged { effect, name, value } => Some(Payload::SetEffectParameter {
                entity: effect.clone(),
                parameter: name.clone(),
                value: value.clone(),
            }),
            _ => None,
        }
    }

    fn inbound(payload: &Payload) -> Option<RemoteChange> {
        match payload {
            Payload::SetEffectParameter {
                entity,
                parameter,
                value,
            } => Some(RemoteChange {
                entity: entity.clone(),
                kinds: &[EntityKind::Effect],
                update: Update::Apply(Change::SetParameter {
                    name: parameter.clone(),
                    value: value.clone(),
                }),
            }),
            _ => None,
        }
    }

    fn filters() -> Vec<RemoveDuplicateMessagesFilter> {
        vec![RemoveDuplicateMessagesFilter::matching(
            MessageKind::SetEffectParameter,
            &["entity", "parameter"],
        )]
    }
}
