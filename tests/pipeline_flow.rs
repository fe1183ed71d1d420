use std::sync::Arc;
use std::time::Duration;

use docqa_backend::core::config::AppSettings;
use docqa_backend::core::errors::RagError;
use docqa_backend::llm::stub::{FailingEngine, ScriptedGenerator};
use docqa_backend::llm::{GenerativeEngine, HashingEmbedder};
use docqa_backend::rag::{
    Chunker, DegradedStage, Document, RagPipeline, RagStore, SqliteRagStore, StreamEvent,
};

const SKY_AND_GRASS: &str = "The sky is blue. The grass is green.";

fn settings() -> AppSettings {
    let mut settings = AppSettings::default();
    settings.chunking.chunk_size = 20;
    settings.chunking.chunk_overlap = 5;
    settings
}

fn pipeline(generator: Arc<dyn GenerativeEngine>) -> RagPipeline {
    RagPipeline::builder(settings())
        .embedder(Arc::new(HashingEmbedder::new(256)))
        .generator(generator)
        .build()
        .unwrap()
}

#[test]
fn sky_document_chunks_with_visible_overlap() {
    let chunker = Chunker::new(20, 5).unwrap();
    let passages = chunker.split(SKY_AND_GRASS);

    assert!(passages.len() >= 2);
    for passage in &passages {
        assert!(passage.chars().count() <= 20, "{:?} is too long", passage);
    }
    for pair in passages.windows(2) {
        let head: String = pair[1].chars().take(5).collect();
        assert!(pair[0].ends_with(&head));
    }
    assert_eq!(chunker.reassemble(&passages), SKY_AND_GRASS);
}

#[tokio::test]
async fn blank_documents_are_rejected() {
    let pipeline = pipeline(Arc::new(ScriptedGenerator::echo()));
    for text in ["", " \n"] {
        let result = pipeline.ingest(Document::new(text)).await;
        assert!(matches!(result, Err(RagError::EmptyInput(_))));
    }
}

#[tokio::test]
async fn ingest_adds_exactly_the_returned_passages() {
    let pipeline = pipeline(Arc::new(ScriptedGenerator::echo()));
    let before = pipeline.status().await.unwrap().document_count;

    let receipt = pipeline.ingest(Document::new(SKY_AND_GRASS)).await.unwrap();
    let after = pipeline.status().await.unwrap().document_count;
    assert_eq!(after - before, receipt.passage_ids.len());

    let second = pipeline
        .ingest(Document::new("Rust has no garbage collector."))
        .await
        .unwrap();
    assert_eq!(
        pipeline.status().await.unwrap().document_count,
        after + second.count
    );
}

#[tokio::test]
async fn search_with_large_k_returns_every_passage() {
    let pipeline = pipeline(Arc::new(ScriptedGenerator::echo()));
    let receipt = pipeline.ingest(Document::new(SKY_AND_GRASS)).await.unwrap();

    let hits = pipeline.search("grass", 20).await.unwrap();
    assert_eq!(hits.len(), receipt.count);
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn echoed_answer_is_grounded_in_the_sky_passage() {
    let pipeline = pipeline(Arc::new(ScriptedGenerator::echo()));
    pipeline.ingest(Document::new(SKY_AND_GRASS)).await.unwrap();

    let answer = pipeline.answer("What color is the sky?").await.unwrap();
    assert!(answer.answer_text.contains("sky is blue"));
    assert!(!answer.sources.is_empty());
}

#[tokio::test]
async fn rerank_failure_still_answers_in_retrieval_order() {
    let pipeline = RagPipeline::builder(settings())
        .embedder(Arc::new(HashingEmbedder::new(256)))
        .generator(Arc::new(ScriptedGenerator::echo()))
        .rerank_engine(Arc::new(FailingEngine::new()))
        .build()
        .unwrap();
    pipeline.ingest(Document::new(SKY_AND_GRASS)).await.unwrap();

    let answer = pipeline.answer("What color is the sky?").await.unwrap();
    assert!(answer.degraded.contains(&DegradedStage::Rerank));

    let hits = pipeline.search(&answer.rewritten_query, 3).await.unwrap();
    let expected: Vec<&str> = hits.iter().map(|hit| hit.passage_id.as_str()).collect();
    let actual: Vec<&str> = answer.sources.iter().map(|s| s.passage_id.as_str()).collect();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn streamed_fragments_concatenate_to_the_batch_answer() {
    let pipeline = pipeline(Arc::new(ScriptedGenerator::echo()));
    pipeline.ingest(Document::new(SKY_AND_GRASS)).await.unwrap();

    let batch = pipeline.answer("What color is the sky?").await.unwrap();

    let mut stream = pipeline.answer_stream("What color is the sky?").await.unwrap();
    let mut streamed = String::new();
    let mut terminals = 0;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Fragment(fragment) => streamed.push_str(&fragment),
            StreamEvent::Completed => terminals += 1,
            StreamEvent::Failed(reason) => panic!("stream failed: {}", reason),
        }
    }

    assert_eq!(terminals, 1);
    assert_eq!(streamed, batch.answer_text);
}

#[tokio::test]
async fn disconnect_after_three_fragments_stops_the_engine() {
    let engine = Arc::new(
        ScriptedGenerator::fixed("tok ".repeat(1000)).with_fragment_delay(Duration::from_millis(5)),
    );
    let pipeline = pipeline(engine.clone());
    pipeline.ingest(Document::new(SKY_AND_GRASS)).await.unwrap();

    let mut stream = pipeline.answer_stream("What color is the sky?").await.unwrap();
    for _ in 0..3 {
        assert!(matches!(stream.next().await, Some(StreamEvent::Fragment(_))));
    }
    drop(stream);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let produced = engine.fragments_produced();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.fragments_produced(), produced);
    assert!(produced <= 7, "engine produced {} fragments", produced);
}

#[tokio::test]
async fn persistent_index_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first_ids = {
        let store: Arc<dyn RagStore> =
            Arc::new(SqliteRagStore::open(dir.path(), "rag_collection").await.unwrap());
        let pipeline = RagPipeline::builder(settings())
            .embedder(Arc::new(HashingEmbedder::new(256)))
            .generator(Arc::new(ScriptedGenerator::echo()))
            .store(store)
            .build()
            .unwrap();
        pipeline
            .ingest(Document::new(SKY_AND_GRASS))
            .await
            .unwrap()
            .passage_ids
    };

    let store: Arc<dyn RagStore> =
        Arc::new(SqliteRagStore::open(dir.path(), "rag_collection").await.unwrap());
    let reopened = RagPipeline::builder(settings())
        .embedder(Arc::new(HashingEmbedder::new(256)))
        .generator(Arc::new(ScriptedGenerator::echo()))
        .store(store)
        .build()
        .unwrap();

    let status = reopened.status().await.unwrap();
    assert_eq!(status.document_count, first_ids.len());
    assert!(status.is_persistent);

    let answer = reopened.answer("What color is the sky?").await.unwrap();
    assert!(answer.answer_text.contains("sky is blue"));
}
