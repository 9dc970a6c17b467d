#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

mod utils;

use chatsync::cache::CacheManager;
use chatsync::config::{default_data_dir, SyncConfig};
use chatsync::models::Direction;
use chatsync::service::{ChatService, MessageService, Uploader};
use chatsync::store::{FileKeyValueStore, MemoryBlobStore, MemoryRemoteStore, MemoryResponseCache};
use chatsync::sync::{ChatFeed, SubscriptionManager};
use chatsync::view::{ChatViewModel, ChatViewState};

/// Command line arguments for the chatsync demo
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: live chat synchronization and caching demo.",
    long_about = "Runs a user-side chat view against an in-memory remote store, sends a few \
    messages in both directions and prints the reconciled chat.\n\n\
    Settings are read from the config file, then CHATSYNC_* environment variables, then flags."
)]
struct Args {
    /// JSON config file (defaults to the user config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Phone number of the user whose chat is shown
    #[arg(long, default_value = "+54 9 11 5555-0100")]
    identity: String,

    /// Override the debounce window in milliseconds
    #[arg(long, value_name = "MS")]
    throttle_ms: Option<u64>,

    /// Directory for the local key-value cache
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,
}

/// Wait until the view state satisfies `predicate`
async fn wait_for_state<F>(view: &ChatViewModel, wait: Duration, predicate: F) -> Result<ChatViewState>
where
    F: Fn(&ChatViewState) -> bool,
{
    let mut rx = view.watch();
    let state = timeout(wait, rx.wait_for(|state| predicate(state)))
        .await
        .map_err(|_| anyhow!("Timed out waiting for the chat view"))??
        .clone();
    Ok(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    utils::init_logging(
        args.log_file.as_deref().and_then(|path| path.to_str()),
        LevelFilter::Info,
    )?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    let mut config = SyncConfig::load(args.config.as_deref())?;
    if let Some(ms) = args.throttle_ms {
        config.throttle_window_ms = ms;
        config.normalize();
    }
    info!("Using throttle window of {}ms", config.throttle_window_ms);

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let kv = FileKeyValueStore::open(data_dir.join("cache")).await?;
    info!("Local cache at {}", kv.dir().display());

    let remote = Arc::new(MemoryRemoteStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let messages = MessageService::new(remote.clone(), &config);
    let chats = ChatService::new(remote.clone(), messages.clone(), &config);
    let uploader = Uploader::new(blobs.clone(), &config);

    let chat = chats.create_or_get_chat(&args.identity).await?;
    println!("Opened chat {} for {}", chat.id, chat.phone_number);

    let cache = CacheManager::new(
        &args.identity,
        Arc::new(kv),
        Arc::new(MemoryResponseCache::new()),
        blobs.clone(),
        &config,
    );
    let manager = SubscriptionManager::new(
        remote.clone(),
        ChatFeed::ByPhone(chat.phone_number.clone()),
        &config,
    );
    let view = ChatViewModel::new(manager.clone(), cache, messages.clone(), Direction::Incoming);
    view.mount().await;

    if view.state().from_cache {
        println!("Painted from cache before the live feed arrived");
    }
    let wait = config.throttle_window() * 3 + Duration::from_secs(2);
    wait_for_state(&view, wait, |state| state.initialized).await?;

    view.send("Hola, necesito ayuda con mi pedido", None).await?;
    let receipt = uploader
        .upload_attachment("receipt.png", "image/png", vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3])
        .await?;
    view.send("", Some(receipt)).await?;
    messages
        .send_admin_message(&chat.id, "Claro, ¿cuál es el número de pedido?", None)
        .await?;

    let state = wait_for_state(&view, wait, |state| {
        state
            .chat
            .as_ref()
            .map_or(false, |chat| chat.last_message.starts_with("Claro"))
    })
    .await?;

    match &state.chat {
        Some(chat) => println!("{}", utils::format_chat(chat)),
        None => warn!("No chat in view"),
    }
    if let Some(report) = state.prefetch {
        println!(
            "Media prefetch: {} fetched, {} already cached, {} failed",
            report.fetched, report.hits, report.failed
        );
    }

    view.unmount();
    manager.shutdown();
    info!("Demo finished");
    Ok(())
}
