use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{
    filter_conversations, ClientEvent, ClientSettings, ConversationListView, HttpMessageStore,
    MessagingEngine, StaticSession, ThreadView,
};
use shared::domain::UserId;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal front end for the messaging engine. Settings come from
/// `client.toml` and `CLIENT__*` variables; flags override them.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    viewer: Option<String>,
    /// Open the conversation with this user (marks it read).
    #[arg(long)]
    counterpart: Option<String>,
    #[arg(long, requires = "counterpart")]
    send: Option<String>,
    /// Only list conversations whose name or category contains this text.
    #[arg(long)]
    filter: Option<String>,
    /// Keep running and print every change until interrupted.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = ClientSettings::load()?;
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }
    let viewer = args
        .viewer
        .clone()
        .or_else(|| settings.viewer_id.clone())
        .ok_or_else(|| anyhow!("no viewer: pass --viewer or set viewer_id"))?;

    let store = Arc::new(HttpMessageStore::new(&settings.server_url)?);
    let session = Arc::new(StaticSession::new(Some(UserId::from(viewer))));
    let engine = MessagingEngine::new(store.clone(), store, session, settings);
    let mut events = engine.subscribe_events();
    engine.sync_session().await?;

    let mut list = engine.conversations();
    tokio::time::timeout(LOAD_TIMEOUT, list.wait_for(|view| view.loaded))
        .await
        .context("timed out loading conversations")??;

    if let Some(counterpart) = args.counterpart.as_deref().map(UserId::from) {
        let report = engine.select_conversation(&counterpart).await?;
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "some messages could not be marked read");
        }
        if let Some(text) = args.send.as_deref() {
            let message_id = engine.send(&counterpart, text).await?;
            info!(message_id = message_id.0, "sent");
        }
    }

    print_conversations(&list.borrow_and_update(), args.filter.as_deref());
    println!("unread: {}", *engine.badge().borrow());
    if let Some(thread) = engine.thread().borrow().as_ref() {
        print_thread(thread);
    }

    if args.watch {
        watch(&engine, &mut events, args.filter.as_deref()).await?;
    }
    engine.sign_out();
    Ok(())
}

async fn watch(
    engine: &MessagingEngine,
    events: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    filter: Option<&str>,
) -> Result<()> {
    let mut list = engine.conversations();
    let mut badge = engine.badge();
    let mut thread = engine.thread();
    list.mark_unchanged();
    badge.mark_unchanged();
    thread.mark_unchanged();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            changed = list.changed() => {
                changed?;
                print_conversations(&list.borrow_and_update(), filter);
            }
            changed = badge.changed() => {
                changed?;
                println!("unread: {}", *badge.borrow_and_update());
            }
            changed = thread.changed() => {
                changed?;
                if let Some(view) = thread.borrow_and_update().as_ref() {
                    print_thread(view);
                }
            }
            event = events.recv() => match event {
                Ok(ClientEvent::IntegrityFault(fault)) => warn!(%fault, "skipped malformed message"),
                Ok(event) => info!(?event, "client event"),
                Err(err) => warn!(error = %err, "missed client events"),
            },
        }
    }
}

fn print_conversations(view: &ConversationListView, filter: Option<&str>) {
    let conversations = filter_conversations(&view.conversations, filter.unwrap_or(""));
    println!("-- conversations ({}) --", conversations.len());
    for conversation in &conversations {
        let when = conversation
            .last_message_time()
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:>3}  {:<20} {:<16} {}",
            conversation.unread_count,
            conversation.counterpart.name,
            when,
            conversation.last_message.preview()
        );
    }
}

fn print_thread(thread: &ThreadView) {
    println!(
        "-- {} ({} unread) --",
        thread.counterpart.name, thread.unread_count
    );
    for message in &thread.messages {
        println!(
            "[{}] {}: {}",
            message.timestamp.format("%H:%M:%S"),
            message.sender_name.as_deref().unwrap_or(message.sender_id.as_str()),
            message.content
        );
    }
}
