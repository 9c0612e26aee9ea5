//! End-to-end orchestrator scenarios over scripted collaborators.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use cortex_core::config::RuntimeConfig;
use cortex_core::error::CortexError;
use cortex_core::state::QueryInput;
use cortex_core::traits::{ConfigStore, NeuronSource, SharedCache, ToolRouter};
use cortex_core::types::{StreamEvent, SYSTEM_DEFAULT_GRAPH_ID};
use cortex_registry::GraphRegistry;
use cortex_runtime::{Orchestrator, Reply, RespondOptions, TransportItem};
use cortex_stream::MemorySharedCache;

use common::{fastpath_graph, responder_graph, FakeNeurons, MemStore, RecordingTools, ScriptedLm};

struct Harness {
    orchestrator: Orchestrator,
    tools: RecordingTools,
    cache: Arc<MemorySharedCache>,
}

fn harness(store: MemStore, lm: ScriptedLm) -> Harness {
    let tools = RecordingTools::new();
    let cache = Arc::new(MemorySharedCache::new());
    let store: Arc<dyn ConfigStore> = Arc::new(store);
    let orchestrator = Orchestrator::new(
        RuntimeConfig::default(),
        store.clone(),
        Arc::new(GraphRegistry::new(store)),
        FakeNeurons::new(lm) as Arc<dyn NeuronSource>,
        Arc::new(tools.clone()) as Arc<dyn ToolRouter>,
        cache.clone() as Arc<dyn SharedCache>,
    );
    Harness {
        orchestrator,
        tools,
        cache,
    }
}

async fn drain(reply: Reply) -> Vec<TransportItem> {
    match reply {
        Reply::Stream(stream) => stream.collect().await,
        Reply::Message(message) => vec![TransportItem::Final(message)],
    }
}

fn events(items: &[TransportItem]) -> Vec<&StreamEvent> {
    items
        .iter()
        .filter_map(|i| match i {
            TransportItem::Event(e) => Some(e),
            _ => None,
        })
        .collect()
}

fn streamed_content(items: &[TransportItem]) -> String {
    events(items)
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_tier_denied_graph_falls_back_to_default() {
    let store = MemStore::default();
    store.put_graph(responder_graph("research-mode", 3));
    store.put_graph(responder_graph(SYSTEM_DEFAULT_GRAPH_ID, 4));
    store.put_user("u1", 4);

    let h = harness(store, ScriptedLm::streaming(&["fallback answer"]));
    let mut options = RespondOptions::for_user("u1");
    options.graph_id = Some("research-mode".into());
    options.stream = true;

    let items = drain(
        h.orchestrator
            .respond(QueryInput { message: "hi".into() }, options)
            .await
            .unwrap(),
    )
    .await;

    // First item is the metadata envelope.
    assert!(matches!(items[0], TransportItem::Metadata { .. }));
    // The run completed on the fallback graph.
    assert!(matches!(items.last().unwrap(), TransportItem::Final(m) if m.content == "fallback answer"));
    assert!(events(&items)
        .iter()
        .any(|e| matches!(e, StreamEvent::Complete { .. })));

    // Both the user and the assistant message were persisted.
    let appended = h.tools.calls_named("history_append");
    assert_eq!(appended.len(), 2);
    assert_eq!(appended[0]["role"], "user");
    assert_eq!(appended[1]["role"], "assistant");
    assert_eq!(appended[1]["content"], "fallback answer");
}

#[tokio::test]
async fn test_unknown_graph_falls_back_to_default() {
    let store = MemStore::default();
    store.put_graph(responder_graph(SYSTEM_DEFAULT_GRAPH_ID, 4));

    let h = harness(store, ScriptedLm::streaming(&["ok"]));
    let mut options = RespondOptions::for_user("u1");
    options.graph_id = Some("does-not-exist".into());

    let reply = h
        .orchestrator
        .respond(QueryInput { message: "q".into() }, options)
        .await
        .unwrap();
    match reply {
        Reply::Message(message) => assert_eq!(message.content, "ok"),
        Reply::Stream(_) => panic!("expected non-streaming reply"),
    }
}

#[tokio::test]
async fn test_greeting_fastpath_short_circuits() {
    let store = MemStore::default();
    store.put_graph(fastpath_graph(SYSTEM_DEFAULT_GRAPH_ID));

    let h = harness(store, ScriptedLm::streaming(&["should not run"]));
    let mut options = RespondOptions::for_user("u1");
    options.stream = true;

    let items = drain(
        h.orchestrator
            .respond(QueryInput { message: "hello".into() }, options)
            .await
            .unwrap(),
    )
    .await;

    assert!(matches!(items.last().unwrap(), TransportItem::Final(m) if m.content == "Hi!"));
    // The graph never reached the search node.
    assert!(h.tools.calls_named("web_search").is_empty());
    assert!(events(&items)
        .iter()
        .any(|e| matches!(e, StreamEvent::Complete { .. })));
}

#[tokio::test]
async fn test_non_greeting_routes_through_search() {
    let store = MemStore::default();
    store.put_graph(fastpath_graph(SYSTEM_DEFAULT_GRAPH_ID));

    let h = harness(store, ScriptedLm::streaming(&["searched answer"]));
    let mut options = RespondOptions::for_user("u1");
    options.stream = true;

    let items = drain(
        h.orchestrator
            .respond(QueryInput { message: "latest rust release".into() }, options)
            .await
            .unwrap(),
    )
    .await;

    let searches = h.tools.calls_named("web_search");
    assert_eq!(searches.len(), 1);
    assert_eq!(searches[0]["query"], "latest rust release");
    assert!(events(&items)
        .iter()
        .any(|e| matches!(e, StreamEvent::ToolEvent { .. })));
    assert!(matches!(items.last().unwrap(), TransportItem::Final(m) if m.content == "searched answer"));
}

#[tokio::test]
async fn test_thinking_extraction_end_to_end() {
    let store = MemStore::default();
    store.put_graph(responder_graph(SYSTEM_DEFAULT_GRAPH_ID, 4));

    let h = harness(store, ScriptedLm::streaming(&["<think>plan</think> answer"]));
    let mut options = RespondOptions::for_user("u1");
    options.stream = true;
    options.message_id = Some("m-think".into());

    let items = drain(
        h.orchestrator
            .respond(QueryInput { message: "why".into() }, options)
            .await
            .unwrap(),
    )
    .await;

    let events = events(&items);
    let status_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Status { action, .. } if action == "thinking"))
        .expect("thinking status published");
    let thinking: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ThinkingChunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(thinking, "plan");

    let first_chunk_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Chunk { .. }))
        .expect("content chunk published");
    assert!(status_pos < first_chunk_pos);
    match events[first_chunk_pos] {
        StreamEvent::Chunk { content } => assert_eq!(content, " "),
        _ => unreachable!(),
    }

    // Durable projection: content without the reasoning or the synthetic
    // separator, thinking kept aside. A reconnecting subscriber snapshots
    // exactly this.
    let state = h.cache.generation_state("m-think").await.unwrap();
    assert_eq!(state.content, "answer");
    assert_eq!(state.thinking, "plan");
    // The persisted assistant message carries the extracted content and the
    // thinking separately.
    let appended = h.tools.calls_named("history_append");
    assert_eq!(appended[1]["content"], "answer");
    assert_eq!(appended[1]["thinking"], "plan");
    assert!(matches!(items.last().unwrap(), TransportItem::Final(m) if m.content == "answer"));
}

#[tokio::test]
async fn test_concurrent_generation_same_conversation_rejected() {
    let store = MemStore::default();
    store.put_graph(responder_graph(SYSTEM_DEFAULT_GRAPH_ID, 4));

    let h = harness(
        store,
        ScriptedLm::slow(&["slow ", "answer"], Duration::from_millis(150)),
    );

    let mut first = RespondOptions::for_user("u1");
    first.conversation_id = Some("conv-1".into());
    first.stream = true;
    let first_reply = h
        .orchestrator
        .respond(QueryInput { message: "one".into() }, first)
        .await
        .unwrap();

    // While the first generation is streaming, a second request on the same
    // conversation must be refused.
    let mut second = RespondOptions::for_user("u1");
    second.conversation_id = Some("conv-1".into());
    second.stream = true;
    let err = h
        .orchestrator
        .respond(QueryInput { message: "two".into() }, second)
        .await
        .unwrap_err();
    assert!(matches!(err, CortexError::AlreadyInProgress(_)));

    // The winning stream still completes normally.
    let items = drain(first_reply).await;
    assert!(matches!(items.last().unwrap(), TransportItem::Final(m) if m.content == "slow answer"));
}

#[tokio::test]
async fn test_abort_stream_fails_generation() {
    let store = MemStore::default();
    store.put_graph(responder_graph(SYSTEM_DEFAULT_GRAPH_ID, 4));

    let h = harness(
        store,
        ScriptedLm::slow(&["a", "b", "c", "d"], Duration::from_millis(200)),
    );
    let mut options = RespondOptions::for_user("u1");
    options.stream = true;

    let reply = h
        .orchestrator
        .respond(QueryInput { message: "long task".into() }, options)
        .await
        .unwrap();
    let mut stream = match reply {
        Reply::Stream(stream) => stream,
        Reply::Message(_) => panic!("expected stream"),
    };

    // Metadata arrives first and carries the generation id to abort.
    let generation_id = match stream.next().await.unwrap() {
        TransportItem::Metadata { generation_id, .. } => generation_id,
        other => panic!("unexpected item: {:?}", other),
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.orchestrator.abort_stream(&generation_id));

    let rest: Vec<TransportItem> = stream.collect().await;
    let got_error = rest
        .iter()
        .any(|i| matches!(i, TransportItem::Event(StreamEvent::Error { .. })));
    assert!(got_error, "expected an error event after abort");
    let got_final = rest.iter().any(|i| matches!(i, TransportItem::Final(_)));
    assert!(!got_final, "aborted stream must not produce a final message");
}

#[tokio::test]
async fn test_streaming_and_non_streaming_agree_modulo_extraction() {
    let raw = "<think>plan</think> answer";

    // Non-streaming: the raw LM output lands in the response.
    let store = MemStore::default();
    store.put_graph(responder_graph(SYSTEM_DEFAULT_GRAPH_ID, 4));
    let h = harness(store, ScriptedLm::streaming(&[raw]));
    let reply = h
        .orchestrator
        .respond(
            QueryInput { message: "q".into() },
            RespondOptions::for_user("u1"),
        )
        .await
        .unwrap();
    let plain = match reply {
        Reply::Message(message) => message.content,
        Reply::Stream(_) => panic!("expected message"),
    };

    // Streaming: the transport sees the extracted content.
    let store = MemStore::default();
    store.put_graph(responder_graph(SYSTEM_DEFAULT_GRAPH_ID, 4));
    let h = harness(store, ScriptedLm::streaming(&[raw]));
    let mut options = RespondOptions::for_user("u1");
    options.stream = true;
    let items = drain(
        h.orchestrator
            .respond(QueryInput { message: "q".into() }, options)
            .await
            .unwrap(),
    )
    .await;

    let streamed = streamed_content(&items);
    let extracted = plain
        .replace("<think>plan</think>", "")
        .trim_start()
        .to_string();
    assert_eq!(streamed.trim_start(), extracted);
}
