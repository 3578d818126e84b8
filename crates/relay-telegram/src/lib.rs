//! Telegram adapter (teloxide).
//!
//! This crate implements the `relay-core` ports over the Telegram Bot API:
//! the delivery transport (server-side copy / album re-send), the channel-post
//! intake loop and the admin notifier.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{
        InputFile, InputMedia, InputMediaAudio, InputMediaDocument, InputMediaPhoto,
        InputMediaVideo,
    },
    ApiError, RequestError,
};

pub mod intake;
pub mod notifier;

use relay_core::{
    domain::{ChannelId, EventId, EventKind, ReleasedUnit},
    errors::DeliveryError,
    ports::TransportPort,
};

#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(channel_id: ChannelId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(channel_id.0)
    }

    /// Server-side copy of one source message. No "forwarded from" header,
    /// and no media ever passes through this process.
    async fn copy_single(
        &self,
        destination: ChannelId,
        source: ChannelId,
        event_id: EventId,
    ) -> std::result::Result<EventId, DeliveryError> {
        let msg_id = self
            .bot
            .copy_message(
                Self::tg_chat(destination),
                Self::tg_chat(source),
                teloxide::types::MessageId(event_id.0 as i32),
            )
            .await
            .map_err(classify_error)?;
        Ok(EventId(i64::from(msg_id.0)))
    }
}

#[async_trait]
impl TransportPort for TelegramTransport {
    async fn deliver(
        &self,
        destination: ChannelId,
        unit: &ReleasedUnit,
    ) -> std::result::Result<EventId, DeliveryError> {
        let Some(first) = unit.first() else {
            return Err(DeliveryError::permanent("empty delivery unit"));
        };

        if unit.is_group() {
            let media = build_album(unit);
            // An album needs at least two rebuildable members; otherwise fall
            // back to copying the lead message.
            if media.len() >= 2 {
                let sent = self
                    .bot
                    .send_media_group(Self::tg_chat(destination), media)
                    .await
                    .map_err(classify_error)?;
                return Ok(sent
                    .first()
                    .map(|m| EventId(i64::from(m.id.0)))
                    .unwrap_or(EventId(0)));
            }
        }

        self.copy_single(destination, first.channel_id, first.event_id)
            .await
    }
}

/// Re-assemble an album from buffered file ids, in event-id order. The
/// caption rides on the first member only; Telegram shows it under the album.
pub fn build_album(unit: &ReleasedUnit) -> Vec<InputMedia> {
    let caption = unit.first().and_then(|e| e.text.clone());
    let mut media = Vec::with_capacity(unit.len());

    for event in &unit.events {
        let Some(file_id) = event.media_file_id.clone() else {
            continue;
        };
        let input = InputFile::file_id(file_id);
        let caption = if media.is_empty() { caption.clone() } else { None };

        let item = match event.kind {
            EventKind::Photo => {
                let mut m = InputMediaPhoto::new(input);
                m.caption = caption;
                InputMedia::Photo(m)
            }
            EventKind::Video => {
                let mut m = InputMediaVideo::new(input);
                m.caption = caption;
                InputMedia::Video(m)
            }
            EventKind::Document => {
                let mut m = InputMediaDocument::new(input);
                m.caption = caption;
                InputMedia::Document(m)
            }
            EventKind::Audio => {
                let mut m = InputMediaAudio::new(input);
                m.caption = caption;
                InputMedia::Audio(m)
            }
            _ => continue,
        };
        media.push(item);
    }

    media
}

/// Map a teloxide failure into the delivery taxonomy.
///
/// The explicit flood-wait carries its own wait duration; network-level
/// failures are worth retrying; a misconfigured or revoked destination is not.
pub fn classify_error(e: RequestError) -> DeliveryError {
    match e {
        RequestError::RetryAfter(wait) => DeliveryError::RateLimited { wait },
        RequestError::MigrateToChatId(id) => {
            DeliveryError::permanent(format!("chat migrated to {id}"))
        }
        RequestError::Network(e) => DeliveryError::transient(format!("network error: {e}")),
        RequestError::Io(e) => DeliveryError::transient(format!("i/o error: {e}")),
        RequestError::InvalidJson { source, .. } => {
            DeliveryError::transient(format!("invalid response: {source}"))
        }
        RequestError::Api(api) => match api {
            ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::UserDeactivated
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::NotEnoughRightsToPostMessages
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots
            | ApiError::GroupDeactivated => {
                DeliveryError::permanent(format!("telegram api error: {api}"))
            }
            other => DeliveryError::transient(format!("telegram api error: {other}")),
        },
    }
}
