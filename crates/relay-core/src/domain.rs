use chrono::{DateTime, Utc};

/// Registered source feed id (internal, assigned at registration).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub i64);

/// External channel identifier (Telegram chat id for the Telegram adapter).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(pub i64);

/// Event id within a source feed (Telegram message id). Monotonic per channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub i64);

/// Telegram user id (numeric). Used for failure notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Content kind of an inbound event, classified at intake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    VideoNote,
    Sticker,
    Animation,
    Poll,
    Location,
    Contact,
    Unsupported,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::Photo => "photo",
            EventKind::Video => "video",
            EventKind::Document => "document",
            EventKind::Audio => "audio",
            EventKind::Voice => "voice",
            EventKind::VideoNote => "video_note",
            EventKind::Sticker => "sticker",
            EventKind::Animation => "animation",
            EventKind::Poll => "poll",
            EventKind::Location => "location",
            EventKind::Contact => "contact",
            EventKind::Unsupported => "unsupported",
        }
    }
}

/// One raw inbound unit of content from a source feed.
///
/// Emitted by the intake adapter in at-least-once, not-necessarily-ordered
/// fashion; everything downstream must tolerate replays.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub source_id: SourceId,
    /// Origin channel, needed for server-side copy at the transport.
    pub channel_id: ChannelId,
    pub event_id: EventId,
    /// Present when this event is one member of a multi-part group (album).
    pub group_id: Option<String>,
    pub kind: EventKind,
    /// Text or caption, used by the keyword filter.
    pub text: Option<String>,
    /// Transport file reference, used for album re-assembly.
    pub media_file_id: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// A unit released by the aggregation window: either a single event or a
/// complete group, delivered downstream as one atomic operation.
#[derive(Clone, Debug)]
pub struct ReleasedUnit {
    /// Members in ascending event-id order.
    pub events: Vec<InboundEvent>,
}

impl ReleasedUnit {
    pub fn single(event: InboundEvent) -> Self {
        Self {
            events: vec![event],
        }
    }

    pub fn is_group(&self) -> bool {
        self.events.len() > 1
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first(&self) -> Option<&InboundEvent> {
        self.events.first()
    }

    pub fn source_id(&self) -> Option<SourceId> {
        self.events.first().map(|e| e.source_id)
    }

    pub fn max_event_id(&self) -> Option<EventId> {
        self.events.iter().map(|e| e.event_id).max()
    }
}

/// A registered source feed.
#[derive(Clone, Debug)]
pub struct Source {
    pub id: SourceId,
    pub channel_id: ChannelId,
    /// High-water mark: highest event id fully processed. Non-decreasing.
    pub last_processed_event_id: EventId,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Durable record of one delivery outcome, keyed by (source id, event id).
///
/// A `Pending` record doubles as a short-lived claim: a second worker seeing
/// a live pending record must not re-deliver the same event.
#[derive(Clone, Debug)]
pub struct DeliveryRecord {
    pub source_id: SourceId,
    pub event_id: EventId,
    pub status: DeliveryStatus,
    pub forwarded_event_id: Option<EventId>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Delivery counts over a trailing time window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub success: u64,
    pub failed: u64,
    pub pending: u64,
}
