use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use braid::{
    AgentSupervisor, BraidError, ChildSpec, DynamicAgentGraph, EngineConfig, GraphEvent,
    GraphExecutor, GraphNode, Invariant, NodeOutput, NodeWork, RestartPolicy, Result,
    SupervisedChild, TokenUsage, WorkContext,
};
use braid_test_utils::{event_counts, Recorder, RecordingWork, ScriptedWork};

const CONFIG: &str = r#"
[pool]
min_size = 1
max_size = 3
grow_threshold = 1

[budget]
max_tokens = 1000

[executor]
checkpoint_every = 2
"#;

fn agent(id: &str, output: &str, recorder: &Recorder) -> GraphNode {
    GraphNode::from_work(
        id,
        RecordingWork::new(ScriptedWork::new(output).with_usage(10, 20), recorder.clone()),
    )
}

#[tokio::test]
async fn test_planner_fan_out_review_pipeline() {
    braid::init_tracing("braid=debug,warn");
    let config = EngineConfig::from_toml(CONFIG).unwrap();
    let recorder = Recorder::new();

    let mut graph = DynamicAgentGraph::new();
    for (id, output) in [
        ("plan", "steps 1-3"),
        ("research", "sources"),
        ("draft", "first draft"),
        ("review", "approved"),
    ] {
        assert!(graph.add_node(agent(id, output, &recorder), "planner").success);
    }
    assert!(graph.add_edge("plan", "research", "planner").success);
    assert!(graph.add_edge("plan", "draft", "planner").success);
    assert!(graph.add_edge("research", "review", "planner").success);
    assert!(graph.add_edge("draft", "review", "planner").success);

    let rejected = graph.add_edge("review", "plan", "critic");
    assert!(!rejected.success);
    assert_eq!(rejected.violations[0].invariant, Invariant::NoCycle);
    assert_eq!(graph.mutation_log().len(), 9);

    let exec = graph.to_executor(config).unwrap();
    let mut stream = exec.stream("write a report");
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    let counts = event_counts(&events);
    assert_eq!(counts.get("node:complete"), Some(&4));
    assert_eq!(counts.get("checkpoint:saved"), Some(&2));
    assert!(counts.get("budget:warning").is_none());

    let Some(GraphEvent::GraphComplete { result, .. }) = events.last() else {
        panic!("run did not complete");
    };
    assert_eq!(result.output, "approved");
    assert_eq!(result.usage, TokenUsage::new(40, 80));

    let review_input = recorder.input_of("review").unwrap();
    assert!(review_input.starts_with("write a report"));
    assert!(review_input.contains("[research]: sources"));
    assert!(review_input.contains("[draft]: first draft"));
}

/// Fails on its first execution, succeeds afterwards.
struct FirstCallFails {
    calls: Arc<AtomicUsize>,
}

impl NodeWork for FirstCallFails {
    fn execute(&self, _input: String, ctx: WorkContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(BraidError::NodeFailed {
                    node: ctx.node_id,
                    message: "cold start".into(),
                });
            }
            Ok(NodeOutput::new("warm"))
        })
    }
}

/// Runs one graph to completion per start.
struct GraphChild {
    executor: GraphExecutor,
    completed_runs: Arc<AtomicUsize>,
}

impl SupervisedChild for GraphChild {
    fn run(&self, _cancel: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.executor.run("tick").await?;
            self.completed_runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_supervisor_restarts_failed_graph_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let completed_runs = Arc::new(AtomicUsize::new(0));
    let work = FirstCallFails {
        calls: calls.clone(),
    };
    let executor = GraphExecutor::new(vec![GraphNode::from_work("job", work)], vec![]).unwrap();
    let child = GraphChild {
        executor,
        completed_runs: completed_runs.clone(),
    };

    let supervisor = AgentSupervisor::builder("pipeline")
        .child(ChildSpec::new("graph", Arc::new(child)).with_restart(RestartPolicy::Transient))
        .build()
        .unwrap();

    supervisor.run(CancellationToken::new()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(completed_runs.load(Ordering::SeqCst), 1);
    let stats = supervisor.stats();
    assert_eq!(stats.total_restarts, 1);
    assert_eq!(stats.children[0].restarts, 1);
    assert!(stats.children[0].last_error.as_deref().unwrap().contains("cold start"));
}
