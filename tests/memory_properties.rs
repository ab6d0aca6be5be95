//! Property tests for the memory layer invariants

use nimbus_core::{
    ContextRetriever, Embedder, HashedEmbedder, MemoryCategory, MemoryEntry, MemoryStore,
    PendingTurn, Route, SqliteMemoryStore,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DIMS: usize = 32;

async fn open_store(dir: &TempDir) -> SqliteMemoryStore {
    SqliteMemoryStore::open(dir.path().join("prop.db"), 256)
        .await
        .expect("open store")
}

async fn put_embedded(store: &SqliteMemoryStore, content: &str) {
    let embedder = HashedEmbedder::new(DIMS);
    let mut entry = MemoryEntry::new(content, MemoryCategory::Conversation);
    entry.embedding = Some(embedder.embed(content).await.unwrap());
    entry.embedding_model = embedder.model_name().to_string();
    store.put(entry).await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// For all input sequences, turn numbers are 1..=n with no gaps,
    /// regardless of route or status.
    #[test]
    fn turn_sequences_strictly_increasing_and_gap_free(
        inputs in proptest::collection::vec("[a-z ]{1,24}", 1..16)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir).await;

            for (i, input) in inputs.iter().enumerate() {
                let route = if i % 2 == 0 { Route::Shell } else { Route::Agent };
                let turn = store
                    .record_turn(PendingTurn::new("prop-session", input, route))
                    .await
                    .unwrap();
                assert_eq!(turn.sequence, (i + 1) as u64);
            }

            let turns = store.turns("prop-session").await.unwrap();
            let sequences: Vec<u64> = turns.iter().map(|t| t.sequence).collect();
            let expected: Vec<u64> = (1..=inputs.len() as u64).collect();
            assert_eq!(sequences, expected);
        });
    }

    /// retrieve(q, k) never exceeds k and never returns superseded entries
    #[test]
    fn retrieval_is_bounded_and_excludes_superseded(
        contents in proptest::collection::vec("[a-z]{3,12}( [a-z]{3,12}){0,3}", 1..12),
        k in 0usize..12
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(open_store(&dir).await);

            for content in &contents {
                put_embedded(&store, content).await;
            }

            // Supersede the first entry when there is more than one
            let live = store.live_entries().await.unwrap();
            let superseded_id = if live.len() > 1 {
                let victim = live[0].id;
                let embedder = HashedEmbedder::new(DIMS);
                let mut replacement =
                    MemoryEntry::new("replacement entry", MemoryCategory::Conversation);
                replacement.embedding =
                    Some(embedder.embed(&replacement.content).await.unwrap());
                replacement.embedding_model = embedder.model_name().to_string();
                store.supersede(victim, replacement).await.unwrap();
                Some(victim)
            } else {
                None
            };

            let retriever = ContextRetriever::new(
                store.clone(),
                Arc::new(HashedEmbedder::new(DIMS)),
                Duration::from_millis(500),
            );

            let results = retriever.retrieve(&contents[0], k).await.unwrap();
            assert!(results.len() <= k);
            if let Some(id) = superseded_id {
                assert!(results.iter().all(|r| r.entry.id != id));
                // Audit trail: still reachable directly
                assert!(store.get(id).await.is_ok());
            }
        });
    }
}
