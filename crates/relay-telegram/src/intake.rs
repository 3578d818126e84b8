//! Channel-post intake: long polling, source lookup, event mapping.

use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::{Mutex, OwnedMutexGuard};

use relay_core::{
    config::Config,
    domain::{ChannelId, EventId, EventKind, InboundEvent, SourceId},
    pipeline::ForwardingPipeline,
};

/// Origin channel id → registered source id.
pub struct SourceMap {
    inner: HashMap<i64, SourceId>,
}

impl SourceMap {
    /// Source ids are assigned by position in the configured channel list,
    /// starting at 1, so they stay stable across restarts.
    pub fn new(channels: &[i64]) -> Self {
        let inner = channels
            .iter()
            .enumerate()
            .map(|(i, &chat)| (chat, SourceId(i as i64 + 1)))
            .collect();
        Self { inner }
    }

    pub fn get(&self, chat_id: i64) -> Option<SourceId> {
        self.inner.get(&chat_id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Per-source intake locks. Posts from one channel are submitted in arrival
/// order; unrelated channels proceed in parallel.
#[derive(Default)]
pub struct SourceLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SourceLocks {
    pub async fn lock_source(&self, source_id: SourceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(source_id.0)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct IntakeState {
    pub pipeline: Arc<ForwardingPipeline>,
    pub sources: SourceMap,
    pub locks: SourceLocks,
}

pub async fn run_polling(
    cfg: Arc<Config>,
    pipeline: Arc<ForwardingPipeline>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    if let Ok(me) = bot.get_me().await {
        println!("relay started: @{}", me.username());
    }
    println!(
        "Relaying {} source channel(s) -> {}",
        cfg.source_channels.len(),
        cfg.destination_channel
    );

    let state = Arc::new(IntakeState {
        pipeline,
        sources: SourceMap::new(&cfg.source_channels),
        locks: SourceLocks::default(),
    });

    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint(handle_channel_post));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build();

    // Stop taking updates on ctrl-c but let in-flight handler tasks finish,
    // so an inline delivery is never killed between the transport send and
    // the ledger commit.
    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("[RELAY] shutdown signal received");
            if let Ok(done) = shutdown.shutdown() {
                done.await;
            }
        }
    });

    // Returns only after the shutdown completes and handler tasks drained.
    dispatcher.dispatch().await;

    Ok(())
}

async fn handle_channel_post(msg: Message, state: Arc<IntakeState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(source_id) = state.sources.get(chat_id) else {
        return Ok(()); // not one of ours
    };

    let Some(event) = map_message(source_id, &msg) else {
        println!(
            "[INTAKE] skipping service post {} in channel {chat_id}",
            msg.id.0
        );
        return Ok(());
    };

    // Singles deliver inline inside submit, so this lock keeps one channel's
    // posts in arrival order end to end.
    let _guard = state.locks.lock_source(source_id).await;
    state.pipeline.submit(event).await;
    Ok(())
}

/// Map a channel post into a pipeline event. `None` for service posts
/// (pinned-message notices and the like) that cannot be copied.
pub fn map_message(source_id: SourceId, msg: &Message) -> Option<InboundEvent> {
    let kind = classify_kind(msg);
    let text = msg
        .text()
        .or_else(|| msg.caption())
        .map(|s| s.to_string());

    if kind == EventKind::Unsupported && text.is_none() {
        return None;
    }

    Some(InboundEvent {
        source_id,
        channel_id: ChannelId(msg.chat.id.0),
        event_id: EventId(i64::from(msg.id.0)),
        group_id: msg.media_group_id().map(|s| s.to_string()),
        kind,
        text,
        media_file_id: media_file_id(msg),
        captured_at: msg.date,
    })
}

fn classify_kind(msg: &Message) -> EventKind {
    if msg.photo().is_some() {
        EventKind::Photo
    } else if msg.video().is_some() {
        EventKind::Video
    } else if msg.document().is_some() {
        EventKind::Document
    } else if msg.audio().is_some() {
        EventKind::Audio
    } else if msg.voice().is_some() {
        EventKind::Voice
    } else if msg.video_note().is_some() {
        EventKind::VideoNote
    } else if msg.sticker().is_some() {
        EventKind::Sticker
    } else if msg.animation().is_some() {
        EventKind::Animation
    } else if msg.poll().is_some() {
        EventKind::Poll
    } else if msg.location().is_some() {
        EventKind::Location
    } else if msg.contact().is_some() {
        EventKind::Contact
    } else if msg.text().is_some() {
        EventKind::Text
    } else {
        EventKind::Unsupported
    }
}

/// File id used to rebuild albums; only album-capable kinds need one.
fn media_file_id(msg: &Message) -> Option<String> {
    if let Some(sizes) = msg.photo() {
        // Largest rendition.
        return sizes.last().map(|p| p.file.id.clone());
    }
    if let Some(video) = msg.video() {
        return Some(video.file.id.clone());
    }
    if let Some(doc) = msg.document() {
        return Some(doc.file.id.clone());
    }
    if let Some(audio) = msg.audio() {
        return Some(audio.file.id.clone());
    }
    None
}
