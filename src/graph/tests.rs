use std::sync::Arc;

use prost_types::field_descriptor_proto::Type;

use super::*;
use crate::definition::{Definitions, LinkDef, LinkEnd, OrchestrationDef, StageDef};
use crate::error::ErrorKind;
use crate::execution::WorkerKind;
use crate::storage::MemoryDefinitionStore;
use crate::test_utils::{
    demo_pool, demo_transport, scalar, streaming, unary, FileBuilder, MemoryServer,
    MemoryTransport,
};

fn orchestration(name: &str, stages: &[&str], links: &[&str]) -> OrchestrationDef {
    OrchestrationDef {
        name: name.to_string(),
        stages: stages.iter().map(|s| s.to_string()).collect(),
        links: links.iter().map(|l| l.to_string()).collect(),
    }
}

fn builder(transport: &MemoryTransport, defs: Definitions) -> GraphBuilder {
    let store = MemoryDefinitionStore::from_definitions(defs).unwrap();
    GraphBuilder::new(Arc::new(store), Resolver::new(Arc::new(transport.clone())))
}

fn demo_stages() -> Vec<StageDef> {
    vec![
        StageDef::new("counter", "counter:1"),
        StageDef::new("counter2", "counter:1"),
        StageDef::new("doubler", "doubler:1"),
        StageDef::new("adder", "adder:1"),
        StageDef::new("merger", "adder:1").with_merge(),
        StageDef::new("splitter", "splitter:1"),
    ]
}

#[tokio::test]
async fn test_build_chain_adds_source_and_sink() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration("double", &["counter", "doubler"], &["c2d"])],
        stages: demo_stages(),
        links: vec![LinkDef::new("c2d", LinkEnd::stage("counter"), LinkEnd::stage("doubler"))],
    };

    let execution = builder(&transport, defs).build("double").await.unwrap();

    assert_eq!(execution.orchestration(), "double");
    assert_eq!(execution.worker_count(), 4);
    assert_eq!(
        execution.layout()["counter"],
        vec![WorkerKind::Source, WorkerKind::Unary]
    );
    assert_eq!(
        execution.layout()["doubler"],
        vec![WorkerKind::Sink, WorkerKind::Unary]
    );
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_field_type_mismatch_fails_before_any_worker() {
    let pool = FileBuilder::new("labels")
        .message("Empty", vec![])
        .message("LabelText", vec![scalar("label", 3, Type::String)])
        .message("LabelInt", vec![scalar("label", 3, Type::Int64)])
        .service("Labeler", vec![unary("Label", "labels.Empty", "labels.LabelText")])
        .service("Tally", vec![unary("Count", "labels.LabelInt", "labels.Empty")])
        .build();
    let transport = MemoryTransport::new();
    transport.serve("labeler:1", MemoryServer::new(pool.clone()).expose("labels.Labeler"));
    transport.serve("tally:1", MemoryServer::new(pool).expose("labels.Tally"));

    let defs = Definitions {
        orchestrations: vec![orchestration("labels", &["labeler", "tally"], &["l2t"])],
        stages: vec![
            StageDef::new("labeler", "labeler:1"),
            StageDef::new("tally", "tally:1"),
        ],
        links: vec![LinkDef::new("l2t", LinkEnd::stage("labeler"), LinkEnd::stage("tally"))],
    };

    let err = builder(&transport, defs).build("labels").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.message().contains("labels.LabelText"));
    assert!(err.message().contains("labels.LabelInt"));
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_missing_orchestration_is_not_found() {
    let transport = demo_transport();
    let err = builder(&transport, Definitions::default())
        .build("nope")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_missing_stage_record_is_not_found() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration("broken", &["counter", "ghost"], &[])],
        stages: demo_stages(),
        links: vec![],
    };
    let err = builder(&transport, defs).build("broken").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_unreachable_stage_fails_whole_build() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration("partial", &["counter", "remote"], &[])],
        stages: vec![
            StageDef::new("counter", "counter:1"),
            StageDef::new("remote", "remote:1"),
        ],
        links: vec![],
    };
    let err = builder(&transport, defs).build("partial").await.unwrap_err();
    assert!(err.is_failed_precondition());
    assert!(err.message().contains("remote"));
}

#[tokio::test]
async fn test_streaming_stage_is_invalid_argument() {
    let pool = FileBuilder::new("feed")
        .message("Tick", vec![scalar("value", 1, Type::Int64)])
        .service("Feed", vec![streaming("Watch", "feed.Tick", "feed.Tick", false, true)])
        .build();
    let transport = MemoryTransport::new();
    transport.serve("feed:1", MemoryServer::new(pool).expose("feed.Feed"));

    let defs = Definitions {
        orchestrations: vec![orchestration("feed", &["feed"], &[])],
        stages: vec![StageDef::new("feed", "feed:1")],
        links: vec![],
    };
    let err = builder(&transport, defs).build("feed").await.unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.message().contains("not unary"));
}

#[tokio::test]
async fn test_projecting_scalar_field_is_not_found() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration("scalar", &["counter", "doubler"], &["bad"])],
        stages: demo_stages(),
        links: vec![LinkDef::new(
            "bad",
            LinkEnd::field("counter", "value"),
            LinkEnd::stage("doubler"),
        )],
    };
    let err = builder(&transport, defs).build("scalar").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_link_to_undeclared_stage_is_not_found() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration("stray", &["counter"], &["c2d"])],
        stages: demo_stages(),
        links: vec![LinkDef::new("c2d", LinkEnd::stage("counter"), LinkEnd::stage("doubler"))],
    };
    let err = builder(&transport, defs).build("stray").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_projected_links_build() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration(
            "projected",
            &["splitter", "doubler"],
            &["right"],
        )],
        stages: demo_stages(),
        links: vec![LinkDef::new(
            "right",
            LinkEnd::field("splitter", "right"),
            LinkEnd::stage("doubler"),
        )],
    };
    let execution = builder(&transport, defs).build("projected").await.unwrap();
    assert_eq!(execution.worker_count(), 4);
}

#[tokio::test]
async fn test_two_inputs_without_merge_is_invalid_argument() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration(
            "fan_in",
            &["counter", "counter2", "adder"],
            &["left", "right"],
        )],
        stages: demo_stages(),
        links: vec![
            LinkDef::new("left", LinkEnd::stage("counter"), LinkEnd::field("adder", "left")),
            LinkDef::new("right", LinkEnd::stage("counter2"), LinkEnd::field("adder", "right")),
        ],
    };
    let err = builder(&transport, defs).build("fan_in").await.unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.message().contains("merge"));
}

#[tokio::test]
async fn test_merge_stage_gets_merge_worker() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration(
            "fan_in",
            &["counter", "counter2", "merger"],
            &["left", "right"],
        )],
        stages: demo_stages(),
        links: vec![
            LinkDef::new("left", LinkEnd::stage("counter"), LinkEnd::field("merger", "left")),
            LinkDef::new("right", LinkEnd::stage("counter2"), LinkEnd::field("merger", "right")),
        ],
    };
    let execution = builder(&transport, defs).build("fan_in").await.unwrap();
    assert_eq!(
        execution.layout()["merger"],
        vec![WorkerKind::Merge, WorkerKind::Sink, WorkerKind::Unary]
    );
}

#[tokio::test]
async fn test_merge_with_two_full_message_links_is_failed_precondition() {
    let pool = FileBuilder::new("wide")
        .message("Empty", vec![])
        .message("Number", vec![scalar("value", 1, Type::Int64)])
        .service("Gen", vec![unary("Next", "wide.Empty", "wide.Number")])
        .service("Sink", vec![unary("Take", "wide.Number", "wide.Empty")])
        .build();
    let transport = MemoryTransport::new();
    transport.serve("gen:1", MemoryServer::new(pool.clone()).expose("wide.Gen"));
    transport.serve("sink:1", MemoryServer::new(pool).expose("wide.Sink"));

    let defs = Definitions {
        orchestrations: vec![orchestration("wide", &["a", "b", "take"], &["a2t", "b2t"])],
        stages: vec![
            StageDef::new("a", "gen:1"),
            StageDef::new("b", "gen:1"),
            StageDef::new("take", "sink:1").with_merge(),
        ],
        links: vec![
            LinkDef::new("a2t", LinkEnd::stage("a"), LinkEnd::stage("take")),
            LinkDef::new("b2t", LinkEnd::stage("b"), LinkEnd::stage("take")),
        ],
    };
    let err = builder(&transport, defs).build("wide").await.unwrap_err();
    assert!(err.is_failed_precondition());
}

#[tokio::test]
async fn test_merge_mixing_full_and_field_links_is_invalid_argument() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration(
            "mixed",
            &["splitter", "counter", "merger"],
            &["whole", "left"],
        )],
        stages: demo_stages(),
        links: vec![
            LinkDef::new("whole", LinkEnd::stage("splitter"), LinkEnd::stage("merger")),
            LinkDef::new("left", LinkEnd::stage("counter"), LinkEnd::field("merger", "left")),
        ],
    };
    let err = builder(&transport, defs).build("mixed").await.unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.message().contains("must name a target field"));
}

#[tokio::test]
async fn test_duplicate_target_field_is_failed_precondition() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration(
            "dup",
            &["counter", "counter2", "merger"],
            &["one", "two"],
        )],
        stages: demo_stages(),
        links: vec![
            LinkDef::new("one", LinkEnd::stage("counter"), LinkEnd::field("merger", "left")),
            LinkDef::new("two", LinkEnd::stage("counter2"), LinkEnd::field("merger", "left")),
        ],
    };
    let err = builder(&transport, defs).build("dup").await.unwrap_err();
    assert!(err.is_failed_precondition());
}

#[tokio::test]
async fn test_two_outputs_is_invalid_argument() {
    let transport = demo_transport();
    let defs = Definitions {
        orchestrations: vec![orchestration(
            "fan_out",
            &["counter", "doubler", "splitter"],
            &["c2d", "c2s"],
        )],
        stages: demo_stages(),
        links: vec![
            LinkDef::new("c2d", LinkEnd::stage("counter"), LinkEnd::stage("doubler")),
            LinkDef::new("c2s", LinkEnd::stage("counter"), LinkEnd::stage("splitter")),
        ],
    };
    let err = builder(&transport, defs).build("fan_out").await.unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.message().contains("output links"));
}

#[tokio::test]
async fn test_duplicate_stage_in_orchestration_is_invalid_argument() {
    let transport = MemoryTransport::new();
    transport.serve("doubler:1", MemoryServer::new(demo_pool()).expose("demo.Doubler"));
    let defs = Definitions {
        orchestrations: vec![orchestration("twice", &["doubler", "doubler"], &[])],
        stages: vec![StageDef::new("doubler", "doubler:1")],
        links: vec![],
    };
    let err = builder(&transport, defs).build("twice").await.unwrap_err();
    assert!(err.is_invalid_argument());
}
