use std::{sync::Arc, time::Duration};

use teloxide::prelude::*;

use relay_core::{
    config::Config,
    domain::{ChannelId, EventId, Source, SourceId},
    pipeline::{ForwardingPipeline, PipelineSettings},
    store::{MemoryStore, Store},
};
use relay_telegram::{notifier::TelegramNotifier, TelegramTransport};

#[tokio::main]
async fn main() -> Result<(), relay_core::Error> {
    relay_core::logging::init("relay")?;

    let cfg = Arc::new(Config::load()?);

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    for (i, &chat) in cfg.source_channels.iter().enumerate() {
        store
            .upsert_source(Source {
                id: SourceId(i as i64 + 1),
                channel_id: ChannelId(chat),
                last_processed_event_id: EventId(0),
                active: true,
            })
            .await?;
    }

    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let transport = Arc::new(TelegramTransport::new(bot.clone()));
    let notifier = Arc::new(TelegramNotifier::new(bot));

    let pipeline = Arc::new(ForwardingPipeline::new(
        store,
        transport,
        notifier,
        PipelineSettings::from_config(&cfg),
    ));

    // Returns after a ctrl-c initiated dispatcher shutdown has drained the
    // intake handler tasks (and their inline deliveries).
    if let Err(e) = relay_telegram::intake::run_polling(cfg.clone(), pipeline.clone()).await {
        eprintln!("[RELAY] intake loop failed: {e}");
    }

    // Drain buffered groups and deliveries the window still has in flight.
    pipeline.shutdown().await;

    match pipeline.stats(Duration::from_secs(24 * 3600)).await {
        Ok(stats) => println!(
            "[RELAY] last 24h: {} delivered, {} failed, {} pending",
            stats.success, stats.failed, stats.pending
        ),
        Err(e) => eprintln!("[RELAY] stats unavailable: {e}"),
    }

    Ok(())
}
