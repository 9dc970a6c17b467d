// Integration tests for the identity-scoped local cache

mod common;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use chatsync::config::SyncConfig;
use chatsync::models::{CacheEntry, Chat, Direction, Message, MessagePreview};
use chatsync::cache::PrefetchOutcome;

use common::{image_preview, Harness};

fn message(id: &str, minute: i64, preview: Option<MessagePreview>) -> Message {
    let content = if preview.is_some() { "" } else { id };
    let mut message = Message::draft(content, preview, Direction::Incoming);
    message.id = id.to_string();
    message.timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(minute);
    message
}

fn chat_with(id: &str, messages: Vec<Message>) -> Chat {
    let mut chat = Chat::new(id, "+1 555 0100");
    chat.messages = messages;
    chat.reconcile_summary();
    chat
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

#[tokio::test]
async fn test_round_trip_keeps_newest_messages() -> Result<()> {
    let harness = Harness::with_config(SyncConfig {
        max_cached_messages: 3,
        ..SyncConfig::default()
    });
    let cache = harness.cache("+1 555 0100");
    assert!(cache.get_cached_chat().await.is_none());

    // Out of order on purpose
    let messages = vec![
        message("m3", 3, None),
        message("m1", 1, None),
        message("m5", 5, None),
        message("m2", 2, None),
        message("m4", 4, None),
    ];
    let chat = chat_with("c1", messages);
    cache.cache_chat(&chat).await;

    let cached = cache.get_cached_chat().await.expect("cached chat");
    assert_eq!(cached.id, "c1");
    assert_eq!(cached.last_message, "m5");
    assert_eq!(ids(&cached.messages), vec!["m3", "m4", "m5"]);

    let entry = cache.get_cached_chat_entry().await.expect("cache entry");
    assert!(entry.is_fresh(ChronoDuration::minutes(5)));
    Ok(())
}

#[tokio::test]
async fn test_identities_never_share_entries() -> Result<()> {
    let harness = Harness::new();
    let alice = harness.cache("+1 555 0001");
    let bob = alice.for_identity("+1 555 0002");

    alice.cache_chat(&chat_with("alice", vec![message("a1", 1, None)])).await;
    assert!(bob.get_cached_chat().await.is_none());

    bob.cache_chat(&chat_with("bob", vec![message("b1", 1, None)])).await;
    assert_eq!(alice.get_cached_chat().await.map(|c| c.id), Some("alice".to_string()));
    assert_eq!(bob.get_cached_chat().await.map(|c| c.id), Some("bob".to_string()));
    assert_ne!(alice.media_cache_name(), bob.media_cache_name());

    bob.clear_cache().await;
    assert!(bob.get_cached_chat().await.is_none());
    assert!(alice.get_cached_chat().await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_invalid_url_is_skipped_without_fetch() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");

    for url in ["", "not a url", "ftp://x/y.png"] {
        assert_eq!(cache.cache_image(url).await, PrefetchOutcome::Skipped);
    }
    assert!(cache.get_cached_image("").await.is_none());
    assert_eq!(harness.blobs.total_fetches(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_fetch_is_reported_not_raised() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");

    harness.host_image("https://x/broken.png");
    harness.blobs.fail_url("https://x/broken.png");
    assert_eq!(cache.cache_image("https://x/broken.png").await, PrefetchOutcome::Failed);
    assert_eq!(cache.cache_image("https://x/missing.png").await, PrefetchOutcome::Failed);
    assert!(cache.get_cached_image("https://x/broken.png").await.is_none());

    harness.host_image("https://x/ok.png");
    harness.media.set_fail_puts(true);
    assert_eq!(cache.cache_image("https://x/ok.png").await, PrefetchOutcome::Failed);
    Ok(())
}

#[tokio::test]
async fn test_cached_image_is_fetched_once() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");
    harness.host_image("https://x/y.png");

    assert_eq!(cache.cache_image("https://x/y.png").await, PrefetchOutcome::Cached);
    assert_eq!(cache.cache_image("https://x/y.png").await, PrefetchOutcome::AlreadyCached);
    assert_eq!(harness.blobs.fetch_count("https://x/y.png"), 1);

    let blob = cache.get_cached_image("https://x/y.png").await.expect("cached blob");
    assert_eq!(blob.content_type, "image/png");
    assert_eq!(harness.media.entry_count(&cache.media_cache_name()).await, 1);
    Ok(())
}

#[tokio::test]
async fn test_storage_failures_are_swallowed() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");
    cache.cache_chat(&chat_with("c1", vec![message("m1", 1, None)])).await;

    harness.kv.set_fail_writes(true);
    cache.cache_chat(&chat_with("c1", vec![message("m2", 2, None)])).await;
    assert_eq!(cache.update_cached_messages("c1", vec![message("m3", 3, None)]).await, 0);
    cache.clear_cache().await;
    harness.kv.set_fail_writes(false);

    // The earlier write is still what a reader sees
    let cached = cache.get_cached_chat().await.expect("cached chat");
    assert_eq!(ids(&cached.messages), vec!["m1"]);

    harness.kv.set_fail_reads(true);
    assert!(cache.get_cached_chat().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_corrupted_entries_read_as_miss() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");

    harness.kv.insert_raw("chatsync_chat_+1 555 0100", "{not json").await;
    assert!(cache.get_cached_chat().await.is_none());

    // Broken message list alone still yields the metadata
    cache.cache_chat(&chat_with("c1", vec![message("m1", 1, None)])).await;
    harness.kv.insert_raw("chatsync_messages_+1 555 0100", "[1, 2").await;
    let cached = cache.get_cached_chat().await.expect("cached chat");
    assert_eq!(cached.id, "c1");
    assert!(cached.messages.is_empty());

    // And a later merge starts over from the new page
    assert_eq!(cache.update_cached_messages("c1", vec![message("m2", 2, None)]).await, 1);
    Ok(())
}

#[tokio::test]
async fn test_page_of_another_chat_is_not_merged() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");
    assert_eq!(cache.update_cached_messages("c1", vec![message("m1", 1, None)]).await, 0);
    assert!(harness.kv.keys().await.is_empty());

    cache.cache_chat(&chat_with("c1", vec![message("m1", 1, None)])).await;
    assert_eq!(cache.update_cached_messages("c2", vec![message("x0", 0, None)]).await, 0);

    let cached = cache.get_cached_chat().await.expect("cached chat");
    assert_eq!(cached.id, "c1");
    assert_eq!(ids(&cached.messages), vec!["m1"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_message_write_drops_metadata() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");
    cache.cache_chat(&chat_with("c1", vec![message("m1", 1, None)])).await;

    harness.kv.fail_writes_to(Some("chatsync_messages_"));
    cache.cache_chat(&chat_with("c2", vec![message("m2", 2, None)])).await;
    harness.kv.fail_writes_to(None);

    // Neither c2 paired with c1's messages nor a stale c1
    assert!(cache.get_cached_chat().await.is_none());
    assert_eq!(harness.kv.keys().await, vec!["chatsync_messages_+1 555 0100".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_message_list_of_another_chat_reads_empty() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");
    cache.cache_chat(&chat_with("c1", vec![message("m1", 1, None)])).await;

    let other = CacheEntry::new(chat_with("c2", Vec::new()).without_messages());
    harness
        .kv
        .insert_raw("chatsync_chat_+1 555 0100", &serde_json::to_string(&other)?)
        .await;

    let cached = cache.get_cached_chat().await.expect("cached chat");
    assert_eq!(cached.id, "c2");
    assert!(cached.messages.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_merge_prefetches_only_new_images() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");
    harness.host_image("https://x/old.png");
    harness.host_image("https://x/new.png");

    let old = message("m1", 1, Some(image_preview("https://x/old.png")));
    cache.cache_chat(&chat_with("c1", vec![old.clone()])).await;

    let added = cache
        .update_cached_messages("c1", vec![old, message("m0", 0, Some(image_preview("https://x/new.png")))])
        .await;
    assert_eq!(added, 1);
    assert_eq!(harness.blobs.fetch_count("https://x/new.png"), 1);
    assert_eq!(harness.blobs.fetch_count("https://x/old.png"), 0);

    let cached = cache.get_cached_chat().await.expect("cached chat");
    assert_eq!(ids(&cached.messages), vec!["m0", "m1"]);
    Ok(())
}

#[tokio::test]
async fn test_merge_respects_cap() -> Result<()> {
    let harness = Harness::with_config(SyncConfig {
        max_cached_messages: 2,
        ..SyncConfig::default()
    });
    let cache = harness.cache("+1 555 0100");
    cache
        .cache_chat(&chat_with("c1", vec![message("m5", 5, None), message("m6", 6, None)]))
        .await;

    // Older than everything retained, so nothing survives the cap
    let added = cache
        .update_cached_messages("c1", vec![message("m1", 1, None), message("m2", 2, None)])
        .await;
    assert_eq!(added, 0);

    let added = cache.update_cached_messages("c1", vec![message("m7", 7, None)]).await;
    assert_eq!(added, 1);
    let cached = cache.get_cached_chat().await.expect("cached chat");
    assert_eq!(ids(&cached.messages), vec!["m6", "m7"]);
    Ok(())
}

#[tokio::test]
async fn test_prefetch_report_counts_outcomes() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");
    harness.host_image("https://x/a.png");
    harness.host_image("https://x/b.png");
    cache.cache_image("https://x/b.png").await;

    let mut chat = chat_with(
        "c1",
        vec![
            message("m1", 1, Some(image_preview("https://x/a.png"))),
            message("m2", 2, Some(image_preview("https://x/b.png"))),
            message("m3", 3, Some(image_preview("https://x/a.png"))),
            message("m4", 4, Some(image_preview("https://x/gone.png"))),
        ],
    );
    chat.avatar_url = "not a url".to_string();

    let report = cache.prefetch_chat_media(&chat).await;
    assert_eq!(report.fetched, 1);
    assert_eq!(report.hits, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.total(), 4);
    Ok(())
}

#[tokio::test]
async fn test_clear_cache_is_idempotent() -> Result<()> {
    let harness = Harness::new();
    let cache = harness.cache("+1 555 0100");
    harness.host_image("https://x/a.png");
    cache.cache_chat(&chat_with("c1", vec![message("m1", 1, None)])).await;
    cache.cache_image("https://x/a.png").await;

    cache.clear_cache().await;
    cache.clear_cache().await;

    assert!(harness.kv.keys().await.is_empty());
    assert!(harness.media.cache_names().await.is_empty());
    assert!(cache.get_cached_chat().await.is_none());
    assert!(cache.get_cached_image("https://x/a.png").await.is_none());
    Ok(())
}
