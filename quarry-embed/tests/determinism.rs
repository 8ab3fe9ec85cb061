use quarry_embed::{EmbedConfig, Embedder, Result};
use std::sync::Arc;

fn corpus() -> Vec<String> {
    [
        "Rust ownership rules prevent data races.",
        "The borrow checker enforces aliasing rules.",
        "Sourdough needs a mature starter.",
        "Rust ownership rules prevent data races.",
        "!!!",
        "Tokio schedules async tasks on a thread pool.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[tokio::test]
async fn test_repeated_calls_are_identical() -> Result<()> {
    let embedder = Embedder::from_config(&EmbedConfig::hashing(128).with_cache_capacity(0)).await?;

    let first = embedder.embed(&corpus()).await?;
    let second = embedder.embed(&corpus()).await?;

    assert_eq!(first, second);
    // Duplicate inputs map to identical vectors.
    assert_eq!(first[0], first[3]);
    Ok(())
}

#[tokio::test]
async fn test_cache_does_not_change_values() -> Result<()> {
    let uncached =
        Embedder::from_config(&EmbedConfig::hashing(128).with_cache_capacity(0)).await?;
    let cached = Embedder::from_config(&EmbedConfig::hashing(128).with_cache_capacity(2)).await?;

    let reference = uncached.embed(&corpus()).await?;
    for _ in 0..3 {
        assert_eq!(cached.embed(&corpus()).await?, reference);
    }
    Ok(())
}

#[tokio::test]
async fn test_batches_and_single_calls_agree() -> Result<()> {
    let embedder = Embedder::from_config(&EmbedConfig::hashing(64).with_batch_size(4)).await?;
    let batch = embedder.embed(&corpus()).await?;

    for (text, expected) in corpus().iter().zip(&batch) {
        assert_eq!(&embedder.embed_one(text).await?, expected);
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_callers_share_an_embedder() -> Result<()> {
    let embedder = Arc::new(Embedder::from_config(&EmbedConfig::hashing(64)).await?);
    let reference = embedder.embed(&corpus()).await?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let embedder = Arc::clone(&embedder);
            tokio::spawn(async move { embedder.embed(&corpus()).await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await??, reference);
    }
    Ok(())
}
