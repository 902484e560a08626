use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tonic::Status;

use super::*;
use crate::definition::{Definitions, LinkDef, LinkEnd, OrchestrationDef, StageDef};
use crate::execution::FailurePolicy;
use crate::storage::MemoryDefinitionStore;
use crate::test_utils::{demo_pool, demo_transport, int_value, MemoryServer, MemoryTransport};
use crate::transport::Connection;

const BOUND: Duration = Duration::from_secs(5);

fn definitions() -> Definitions {
    Definitions {
        orchestrations: vec![
            OrchestrationDef {
                name: "doubling".to_string(),
                stages: vec!["a".to_string(), "b".to_string()],
                links: vec!["a_to_b".to_string()],
            },
            OrchestrationDef {
                name: "summing".to_string(),
                stages: vec!["left".to_string(), "right".to_string(), "sum".to_string()],
                links: vec!["to_left".to_string(), "to_right".to_string()],
            },
            OrchestrationDef {
                name: "broken".to_string(),
                stages: vec!["a".to_string(), "ghost".to_string()],
                links: vec![],
            },
            OrchestrationDef {
                name: "failing".to_string(),
                stages: vec!["bad".to_string()],
                links: vec![],
            },
            OrchestrationDef {
                name: "stalled".to_string(),
                stages: vec!["silent".to_string()],
                links: vec![],
            },
        ],
        stages: vec![
            StageDef::new("a", "counter:1").with_service("demo.Counter"),
            StageDef::new("b", "doubler:1").with_method("Double"),
            StageDef::new("left", "counter:1"),
            StageDef::new("right", "counter:1"),
            StageDef::new("sum", "adder:1").with_merge(),
            StageDef::new("ghost", "nowhere:1"),
            StageDef::new("bad", "broken:1"),
            StageDef::new("silent", "silent:1"),
        ],
        links: vec![
            LinkDef::new("a_to_b", LinkEnd::stage("a"), LinkEnd::stage("b")),
            LinkDef::new("to_left", LinkEnd::stage("left"), LinkEnd::field("sum", "left")),
            LinkDef::new("to_right", LinkEnd::stage("right"), LinkEnd::field("sum", "right")),
        ],
    }
}

fn transport() -> MemoryTransport {
    let transport = demo_transport();
    transport.serve(
        "broken:1",
        MemoryServer::new(demo_pool())
            .handle("demo.Doubler", "Double", |_| Err(Status::unavailable("down"))),
    );
    transport
}

/// Serves the memory transport but never finishes dialing `silent:1`.
struct StallingTransport {
    inner: MemoryTransport,
}

#[async_trait]
impl Transport for StallingTransport {
    async fn connect(&self, address: &str) -> crate::error::Result<Arc<dyn Connection>> {
        if address == "silent:1" {
            std::future::pending::<()>().await;
        }
        self.inner.connect(address).await
    }
}

fn engine(transport: &MemoryTransport, config: EngineConfig) -> Engine {
    let store = MemoryDefinitionStore::from_definitions(definitions()).unwrap();
    Engine::new(Arc::new(store), Arc::new(transport.clone()), &config)
}

async fn wait_for_phase(engine: &Engine, name: &str, phase: Phase) -> Phase {
    let deadline = tokio::time::Instant::now() + BOUND;
    loop {
        let current = engine.phase(name).await.unwrap();
        if current == phase || tokio::time::Instant::now() >= deadline {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_doubling_invokes_b_with_counter_values_in_order() {
    let transport = transport();
    let engine = engine(&transport, EngineConfig::default());

    engine.build_and_start("doubling").await.unwrap();
    assert_eq!(engine.phase("doubling").await.unwrap(), Phase::Running);

    let calls = transport
        .wait_for_responses("/demo.Doubler/Double", 100, BOUND)
        .await;
    assert!(calls.len() >= 100);

    let outputs: Vec<i64> = calls
        .iter()
        .take(100)
        .filter_map(|c| c.response.as_ref().map(int_value))
        .collect();
    let expected: Vec<i64> = (1..=100).map(|n| n * 2).collect();
    assert_eq!(outputs, expected);

    assert_eq!(engine.stop("doubling").await.unwrap(), Phase::Succeeded);
    assert!(engine.running().await.is_empty());
}

#[tokio::test]
async fn test_start_while_running_is_failed_precondition() {
    let transport = transport();
    let engine = engine(&transport, EngineConfig::default());
    engine.build_and_start("doubling").await.unwrap();

    let err = engine.build_and_start("doubling").await.unwrap_err();
    assert!(err.is_failed_precondition());
    let err = engine.start("doubling").await.unwrap_err();
    assert!(err.is_failed_precondition());

    assert_eq!(engine.running().await, vec!["doubling".to_string()]);
    engine.shutdown().await;
    assert!(engine.running().await.is_empty());
    assert_eq!(engine.phase("doubling").await.unwrap(), Phase::Succeeded);
}

#[tokio::test]
async fn test_build_then_start() {
    let transport = transport();
    let engine = engine(&transport, EngineConfig::default());

    let built = engine.build("doubling").await.unwrap();
    assert_eq!(engine.phase("doubling").await.unwrap(), Phase::Pending);
    assert!(transport.calls().is_empty());

    let started = engine.start("doubling").await.unwrap();
    assert_eq!(built, started);
    assert_eq!(engine.stop("doubling").await.unwrap(), Phase::Succeeded);

    // A finished orchestration can be built again.
    let rebuilt = engine.build_and_start("doubling").await.unwrap();
    assert_ne!(rebuilt, built);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_build_failure_records_failed_phase() {
    let transport = transport();
    let engine = engine(&transport, EngineConfig::default());

    let err = engine.build_and_start("broken").await.unwrap_err();
    assert!(err.is_failed_precondition());
    assert!(err.message().contains("ghost"));
    assert_eq!(engine.phase("broken").await.unwrap(), Phase::Failed);
    assert_eq!(engine.last_error("broken").await, Some(err));
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_orchestration() {
    let transport = transport();
    let engine = engine(&transport, EngineConfig::default());

    assert!(engine.phase("nope").await.unwrap_err().is_not_found());
    assert!(engine.stop("nope").await.unwrap_err().is_not_found());
    assert!(engine.start("nope").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_finite_sources_finish_on_their_own() {
    let transport = transport();
    let config = EngineConfig {
        source_limit: Some(3),
        ..Default::default()
    };
    let engine = engine(&transport, config);
    engine.build_and_start("doubling").await.unwrap();

    assert_eq!(
        wait_for_phase(&engine, "doubling", Phase::Succeeded).await,
        Phase::Succeeded
    );
    let outputs: Vec<i64> = transport
        .calls_to("/demo.Doubler/Double")
        .iter()
        .filter_map(|c| c.response.as_ref().map(int_value))
        .collect();
    assert_eq!(outputs, vec![2, 4, 6]);
    assert!(engine.stop("doubling").await.unwrap_err().is_failed_precondition());
}

#[tokio::test]
async fn test_merge_joins_both_branches() {
    let transport = transport();
    let config = EngineConfig {
        source_limit: Some(5),
        ..Default::default()
    };
    let engine = engine(&transport, config);
    engine.build_and_start("summing").await.unwrap();

    assert_eq!(
        wait_for_phase(&engine, "summing", Phase::Succeeded).await,
        Phase::Succeeded
    );
    let sums: Vec<i64> = transport
        .calls_to("/demo.Adder/Add")
        .iter()
        .filter_map(|c| c.response.as_ref().map(int_value))
        .collect();
    // Both branches share one counter, so each branch sees some of 1..=10.
    assert_eq!(sums.len(), 5);
    assert_eq!(sums.iter().sum::<i64>(), (1..=10).sum::<i64>());
}

#[tokio::test]
async fn test_unobserved_failure_fails_orchestration() {
    let transport = transport();
    let engine = engine(&transport, EngineConfig::default());
    engine.build_and_start("failing").await.unwrap();

    assert_eq!(
        wait_for_phase(&engine, "failing", Phase::Failed).await,
        Phase::Failed
    );
    let err = engine.last_error("failing").await.unwrap();
    assert!(err.is_failed_precondition());
    assert!(err.message().contains("stage 'bad'"));
}

#[tokio::test]
async fn test_absorbed_failures_keep_running() {
    let transport = transport();
    let config = EngineConfig {
        failure_policy: FailurePolicy::Absorb,
        ..Default::default()
    };
    let engine = engine(&transport, config);
    engine.build_and_start("failing").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!transport.calls_to("/demo.Doubler/Double").is_empty());
    assert_eq!(engine.phase("failing").await.unwrap(), Phase::Running);
    assert_eq!(engine.stop("failing").await.unwrap(), Phase::Succeeded);
}

#[tokio::test]
async fn test_stalled_build_does_not_block_other_orchestrations() {
    let transport = transport();
    let store = MemoryDefinitionStore::from_definitions(definitions()).unwrap();
    let stalling = StallingTransport {
        inner: transport.clone(),
    };
    let engine = Arc::new(Engine::new(
        Arc::new(store),
        Arc::new(stalling),
        &EngineConfig::default(),
    ));
    engine.build_and_start("doubling").await.unwrap();

    let stalled = tokio::spawn({
        let engine = engine.clone();
        async move { engine.build("stalled").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!stalled.is_finished());

    let prompt = Duration::from_millis(500);
    assert_eq!(
        timeout(prompt, engine.phase("doubling")).await.unwrap().unwrap(),
        Phase::Running
    );
    assert_eq!(timeout(prompt, engine.running()).await.unwrap(), vec!["doubling".to_string()]);
    let err = timeout(prompt, engine.build("stalled")).await.unwrap().unwrap_err();
    assert!(err.is_failed_precondition());
    assert_eq!(
        timeout(prompt, engine.stop("doubling")).await.unwrap().unwrap(),
        Phase::Succeeded
    );
    timeout(prompt, engine.shutdown()).await.unwrap();

    assert!(!stalled.is_finished());
    stalled.abort();
}
