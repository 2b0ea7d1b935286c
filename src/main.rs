mod commands;
mod config;
mod events;
mod history;
mod identity;
mod indexer;
mod matcher;
mod notifier;
mod pipeline;
mod rpc;
mod scanner;
mod store;
mod telegram;
mod utxo;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::commands::CommandHandler;
use crate::config::Config;
use crate::indexer::{EventSource, IndexerClient};
use crate::notifier::Notifier;
use crate::pipeline::Pipeline;
use crate::rpc::{ChainSource, OpRpc};
use crate::store::Store;
use crate::telegram::Telegram;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("opwatch=info".parse().unwrap()),
        )
        .init();

    tracing::info!("👁 opwatch starting...");

    let cfg = Config::from_env()?;
    tracing::info!(
        network = ?cfg.network,
        rpc = %cfg.rpc_url,
        indexer = %cfg.indexer_url,
        poll_ms = cfg.poll_interval_ms,
        "Config loaded"
    );

    // An unreachable store at startup is fatal.
    let store = Store::open(Path::new(&cfg.database_path))?;

    let rpc = Arc::new(OpRpc::new(&cfg.rpc_url));
    let indexer = Arc::new(IndexerClient::new(&cfg.indexer_url));
    let telegram = Arc::new(Telegram::new(&cfg.telegram_bot_token));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Pipeline task: poll, classify, notify.
    let notifier = Notifier::new(Arc::clone(&telegram), store.clone(), cfg.mempool_url.clone());
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::clone(&rpc),
        Arc::clone(&indexer),
        notifier,
        cfg.network,
        Duration::from_millis(cfg.poll_interval_ms),
    );
    let pipeline_handle = tokio::spawn(pipeline.run(shutdown_rx));
    tracing::info!("Pipeline task started");

    let handler = CommandHandler::new(
        store,
        rpc as Arc<dyn ChainSource>,
        indexer as Arc<dyn EventSource>,
        cfg.clone(),
    );

    if let Some(admin) = cfg.admin_chat_id {
        if let Err(e) = telegram.send_message(admin, "👁 opwatch online").await {
            tracing::warn!("Admin startup notice failed: {e}");
        }
    }

    // Command long-poll loop; ctrl-c flips the shutdown signal and the
    // pipeline exits at its next tick boundary.
    let mut offset = 0i64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
                break;
            }
            updates = telegram.get_updates(offset) => {
                match updates {
                    Ok(updates) => {
                        for update in updates {
                            offset = offset.max(update.update_id + 1);
                            handle_update(&handler, &telegram, update).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("getUpdates failed: {e}");
                        tokio::time::sleep(Duration::from_secs(3)).await;
                    }
                }
            }
        }
    }

    pipeline_handle.await?;
    tracing::info!("opwatch stopped");
    Ok(())
}

async fn handle_update(handler: &CommandHandler, telegram: &Telegram, update: telegram::Update) {
    if let Some(message) = update.message {
        let Some(text) = message.text else { return };
        if let Some(reply) = handler.handle(message.chat.id, &text).await {
            if let Err(e) = telegram.send_message(message.chat.id, &reply).await {
                tracing::warn!(chat = message.chat.id, "Reply failed: {e}");
            }
        }
    } else if let Some(callback) = update.callback_query {
        let (Some(data), Some(message)) = (callback.data, callback.message) else {
            return;
        };
        let reply = handler.handle(message.chat.id, &data).await;
        if let Err(e) = telegram.answer_callback_query(&callback.id, "✓").await {
            tracing::debug!("answerCallbackQuery failed: {e}");
        }
        if let Some(reply) = reply {
            // replace the menu message in place rather than posting a new one
            if let Err(e) = telegram
                .edit_message_text(message.chat.id, message.message_id, &reply)
                .await
            {
                tracing::warn!(chat = message.chat.id, "Edit failed: {e}");
            }
        }
    }
}
