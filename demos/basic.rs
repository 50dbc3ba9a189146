use std::time::Duration;

use flagstore::{FlagStore, RestSource, SseChangeFeed, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let base_url = std::env::var("FLAGS_DB_URL").unwrap_or_else(|_| "http://localhost:54321".to_string());
    let api_key = std::env::var("FLAGS_DB_KEY").unwrap_or_else(|_| "anon-key".to_string());

    // Initialize the store
    let store = FlagStore::builder()
        .with_source(
            RestSource::builder()
                .with_base_url(&base_url)
                .with_api_key(&api_key)
                .build()?,
        )
        .with_feed(
            SseChangeFeed::builder()
                .with_stream_url(&format!("{}/realtime/v1/feature_flags", base_url))
                .with_api_key(&api_key)
                .build()?,
        )
        .with_config(StoreConfig::from_env()?)
        .mount()?;

    while store.loading() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Check if a flag is enabled
    let marketplace = store.is_enabled("beta_marketplace");
    println!("Feature 'beta_marketplace' is enabled: {}", marketplace);
    if let Some(error) = store.error() {
        println!("Last fetch failed: {}", error);
    }

    // List all flags
    println!("All flags:");
    let mut flags: Vec<_> = store.flags().iter().map(|(n, e)| (n.to_string(), e)).collect();
    flags.sort();
    for (name, enabled) in flags {
        println!("  {}: {}", name, enabled);
    }

    // Print every change for a while
    let mut changes = store.subscribe();
    let watch = async {
        while changes.changed().await.is_ok() {
            println!("Enabled flags now: {:?}", store.enabled_flags());
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(60), watch).await;

    store.dispose().await;
    Ok(())
}
