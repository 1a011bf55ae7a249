use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use braid_core::config::{BudgetConfig, EngineConfig, ExecutorConfig, PoolConfig};
use braid_core::error::BraidError;
use braid_core::event::EventBus;
use braid_core::types::{BudgetStatus, GraphCheckpoint, GraphEvent, NodeResult, TokenUsage};
use braid_engine::{Edge, ForkGroup, GraphExecutor, GraphNode};
use braid_test_utils::{
    collect_events, event_counts, event_names, position_of, FailingCheckpointStore,
    FailingConsensus, FailingWork, JoinConsensus, MemoryCheckpointStore, Recorder, RecordingWork,
    ScriptedWork, StubbornWork,
};

fn scripted(id: &str, output: &str) -> GraphNode {
    GraphNode::from_work(id, ScriptedWork::new(output))
}

fn recorded(id: &str, work: ScriptedWork, recorder: &Recorder) -> GraphNode {
    GraphNode::from_work(id, RecordingWork::new(work, recorder.clone()))
}

fn pool(size: usize) -> EngineConfig {
    EngineConfig {
        pool: PoolConfig::fixed(size),
        ..EngineConfig::default()
    }
}

fn chain(ids: &[&str], recorder: &Recorder) -> (Vec<GraphNode>, Vec<Edge>) {
    let nodes = ids
        .iter()
        .map(|id| recorded(id, ScriptedWork::new(format!("out-{}", id)), recorder))
        .collect();
    let edges = ids.windows(2).map(|w| Edge::new(w[0], w[1])).collect();
    (nodes, edges)
}

#[tokio::test]
async fn test_diamond_respects_dependencies() {
    let recorder = Recorder::new();
    let nodes = vec![
        recorded("A", ScriptedWork::new("a").with_delay_ms(5), &recorder),
        recorded("B", ScriptedWork::new("b").with_delay_ms(10), &recorder),
        recorded("C", ScriptedWork::new("c").with_delay_ms(20), &recorder),
        recorded("D", ScriptedWork::new("d"), &recorder),
    ];
    let edges = vec![
        Edge::new("A", "B"),
        Edge::new("A", "C"),
        Edge::new("B", "D"),
        Edge::new("C", "D"),
    ];
    let exec = GraphExecutor::new(nodes, edges).unwrap().with_config(pool(4));

    let result = exec.run("task").await.unwrap();

    assert_eq!(result.output, "d");
    assert_eq!(result.terminal_nodes, vec!["D".to_string()]);
    assert_eq!(result.node_results.len(), 4);

    let starts = recorder.starts();
    assert_eq!(starts.first().map(String::as_str), Some("A"));
    assert_eq!(starts.last().map(String::as_str), Some("D"));

    // D sees its direct dependencies only
    let d_input = recorder.input_of("D").unwrap();
    assert!(d_input.starts_with("task\n\n--- Previous results ---\n"));
    assert!(d_input.contains("[B]: b"));
    assert!(d_input.contains("[C]: c"));
    assert!(!d_input.contains("[A]"));
    assert_eq!(recorder.input_of("A").unwrap(), "task");
}

#[tokio::test]
async fn test_every_node_reported_exactly_once() {
    let recorder = Recorder::new();
    let ids = ["n0", "n1", "n2", "n3", "n4", "n5", "n6"];
    let nodes = ids
        .iter()
        .map(|id| recorded(id, ScriptedWork::new(*id), &recorder))
        .collect();
    let edges = vec![
        Edge::new("n0", "n2"),
        Edge::new("n1", "n2"),
        Edge::new("n2", "n3"),
        Edge::new("n2", "n4"),
        Edge::new("n0", "n5"),
        Edge::new("n3", "n6"),
        Edge::new("n4", "n6"),
        Edge::new("n5", "n6"),
    ];
    let exec = GraphExecutor::new(nodes, edges).unwrap().with_config(pool(3));

    let events = collect_events(exec.stream("go")).await;
    let counts = event_counts(&events);
    assert_eq!(counts.get("node:start"), Some(&7));
    assert_eq!(counts.get("node:complete"), Some(&7));
    assert_eq!(counts.get("graph:complete"), Some(&1));
    assert_eq!(recorder.count(), 7);

    let Some(GraphEvent::GraphComplete { result, .. }) = events.last() else {
        panic!("stream must end with graph:complete");
    };
    assert_eq!(result.node_results.len(), 7);
    assert_eq!(result.output, "n6");
}

#[tokio::test]
async fn test_stream_ordering() {
    let (nodes, edges) = chain(&["a", "b", "c"], &Recorder::new());
    let exec = GraphExecutor::new(nodes, edges).unwrap();

    let events = collect_events(exec.stream("go")).await;
    let names = event_names(&events);
    assert_eq!(names.first(), Some(&"graph:start"));
    assert_eq!(names.last(), Some(&"graph:complete"));
    assert_eq!(names.iter().filter(|n| n.starts_with("graph:")).count(), 2);

    for id in ["a", "b", "c"] {
        let start = position_of(&events, "node:start", id).unwrap();
        let done = position_of(&events, "node:complete", id).unwrap();
        assert!(start < done, "{} completed before it started", id);
    }
    // Causal order along the chain
    assert!(
        position_of(&events, "node:complete", "a").unwrap()
            < position_of(&events, "node:start", "b").unwrap()
    );

    // Offsets never go backwards
    let offsets: Vec<u64> = events
        .iter()
        .map(|e| serde_json::to_value(e).unwrap()["at_ms"].as_u64().unwrap())
        .collect();
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_short_node_completes_before_long_one() {
    let nodes = vec![
        GraphNode::from_work("long", ScriptedWork::new("l").with_delay_ms(200)),
        GraphNode::from_work("short", ScriptedWork::new("s").with_delay_ms(10)),
    ];
    let exec = GraphExecutor::new(nodes, vec![]).unwrap().with_config(pool(2));

    let events = collect_events(exec.stream("go")).await;
    let short = position_of(&events, "node:complete", "short").unwrap();
    let long = position_of(&events, "node:complete", "long").unwrap();
    assert!(short < long);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_config_runs_branches_in_parallel() {
    let nodes = vec![
        scripted("A", "a"),
        GraphNode::from_work("B", ScriptedWork::new("b").with_delay_ms(200)),
        GraphNode::from_work("C", ScriptedWork::new("c").with_delay_ms(200)),
        scripted("D", "d"),
    ];
    let edges = vec![
        Edge::new("A", "B"),
        Edge::new("A", "C"),
        Edge::new("B", "D"),
        Edge::new("C", "D"),
    ];
    let exec = GraphExecutor::new(nodes, edges).unwrap();

    let started = std::time::Instant::now();
    let events = collect_events(exec.stream("go")).await;
    let elapsed = started.elapsed();
    assert_eq!(event_names(&events).last(), Some(&"graph:complete"));

    // B and C overlap: both start before either finishes
    let b_start = position_of(&events, "node:start", "B").unwrap();
    let c_start = position_of(&events, "node:start", "C").unwrap();
    let first_done = position_of(&events, "node:complete", "B")
        .unwrap()
        .min(position_of(&events, "node:complete", "C").unwrap());
    assert!(b_start < first_done && c_start < first_done);
    assert!(elapsed < Duration::from_millis(350), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_priority_orders_ready_nodes() {
    let recorder = Recorder::new();
    let nodes = vec![
        recorded("p10", ScriptedWork::new("x"), &recorder).with_priority(10),
        recorded("p1", ScriptedWork::new("x"), &recorder).with_priority(1),
        recorded("p5", ScriptedWork::new("x"), &recorder).with_priority(5),
    ];
    let exec = GraphExecutor::new(nodes, vec![]).unwrap().with_config(pool(1));
    exec.run("go").await.unwrap();
    assert_eq!(recorder.starts(), vec!["p1", "p5", "p10"]);
}

#[tokio::test]
async fn test_multiple_terminals_render_in_declaration_order() {
    let nodes = vec![scripted("b", "y"), scripted("a", "x")];
    let exec = GraphExecutor::new(nodes, vec![]).unwrap();
    let result = exec.run("go").await.unwrap();
    assert_eq!(result.terminal_nodes, vec!["b".to_string(), "a".to_string()]);
    assert_eq!(result.output, "[b]: y\n[a]: x");
}

#[tokio::test]
async fn test_budget_exceeded_fails_run_with_partial_results() {
    let nodes = vec![
        GraphNode::from_work("a", ScriptedWork::new("ok").with_usage(3, 2)),
        GraphNode::from_work("b", ScriptedWork::new("ok").with_usage(4, 4)),
        GraphNode::from_work("c", ScriptedWork::new("never")),
    ];
    let edges = vec![Edge::new("a", "b"), Edge::new("b", "c")];
    let config = EngineConfig {
        budget: BudgetConfig::with_max_tokens(10),
        ..EngineConfig::default()
    };
    let exec = GraphExecutor::new(nodes, edges).unwrap().with_config(config);

    let failure = exec.run("go").await.unwrap_err();
    assert!(matches!(failure.error, BraidError::BudgetExceeded { used: 13, budget: 10 }));
    assert!(failure.to_string().contains("budget exceeded"));
    // The offending node itself succeeded and is kept
    assert!(failure.partial_results.contains_key("a"));
    assert!(failure.partial_results.contains_key("b"));
    assert!(!failure.partial_results.contains_key("c"));
    assert_eq!(failure.usage.total(), 13);
}

#[tokio::test]
async fn test_budget_warnings_fire_once_per_threshold() {
    let nodes = vec![
        GraphNode::from_work("a", ScriptedWork::new("x").with_usage(40, 0)),
        GraphNode::from_work("b", ScriptedWork::new("x").with_usage(45, 0)),
        GraphNode::from_work("c", ScriptedWork::new("x").with_usage(2, 0)),
        GraphNode::from_work("d", ScriptedWork::new("x").with_usage(10, 0)),
    ];
    let edges = vec![Edge::new("a", "b"), Edge::new("b", "c"), Edge::new("c", "d")];
    let config = EngineConfig {
        budget: BudgetConfig::with_max_tokens(100),
        ..EngineConfig::default()
    };
    let exec = GraphExecutor::new(nodes, edges).unwrap().with_config(config);

    let events = collect_events(exec.stream("go")).await;
    let warnings: Vec<BudgetStatus> = events
        .iter()
        .filter_map(|e| match e {
            GraphEvent::BudgetWarning { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec![BudgetStatus::SoftLimit, BudgetStatus::HardLimit]);
    // 97 of 100 is past the hard threshold but not over budget
    assert_eq!(event_names(&events).last(), Some(&"graph:complete"));
}

#[tokio::test]
async fn test_failing_node_fails_run() {
    let nodes = vec![
        scripted("a", "fine"),
        GraphNode::from_work("b", FailingWork::new("boom")),
        scripted("c", "never"),
    ];
    let edges = vec![Edge::new("a", "b"), Edge::new("b", "c")];
    let exec = GraphExecutor::new(nodes, edges).unwrap();

    let events = collect_events(exec.stream("go")).await;
    let Some(GraphEvent::GraphError {
        error,
        partial_results,
        ..
    }) = events.last()
    else {
        panic!("stream must end with graph:error");
    };
    assert!(error.contains("boom"));
    assert!(partial_results.contains_key("a"));
    assert_eq!(partial_results.len(), 1);

    let b_error = events.iter().find_map(|e| match e {
        GraphEvent::NodeError {
            node_id, timed_out, ..
        } if node_id == "b" => Some(*timed_out),
        _ => None,
    });
    assert_eq!(b_error, Some(false));
    assert!(position_of(&events, "node:start", "c").is_none());
}

#[tokio::test]
async fn test_node_timeout_is_reported_as_timeout() {
    let stubborn = StubbornWork::new(200);
    let nodes = vec![GraphNode::from_work("slow", stubborn.clone())];
    let config = EngineConfig {
        pool: PoolConfig {
            task_timeout_ms: 30,
            ..PoolConfig::fixed(1)
        },
        ..EngineConfig::default()
    };
    let exec = GraphExecutor::new(nodes, vec![]).unwrap().with_config(config);

    let events = collect_events(exec.stream("go")).await;
    let timed_out = events.iter().any(|e| {
        matches!(e, GraphEvent::NodeError { node_id, timed_out: true, error, .. }
            if node_id == "slow" && error.contains("timed out"))
    });
    assert!(timed_out);
    assert_eq!(event_names(&events).last(), Some(&"graph:error"));

    // The detached work still finishes and sees its raised signal
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(stubborn.saw_cancel());
}

#[tokio::test]
async fn test_wall_clock_timeout() {
    let nodes = vec![
        scripted("fast", "f"),
        GraphNode::from_work("slow", ScriptedWork::new("s").with_delay_ms(2_000)),
    ];
    let config = EngineConfig {
        executor: ExecutorConfig {
            timeout_ms: Some(50),
            ..ExecutorConfig::default()
        },
        ..pool(2)
    };
    let exec = GraphExecutor::new(nodes, vec![]).unwrap().with_config(config);

    let started = std::time::Instant::now();
    let failure = exec.run("go").await.unwrap_err();
    assert!(matches!(failure.error, BraidError::GraphTimeout(50)));
    assert!(failure.error.is_timeout());
    assert!(failure.partial_results.contains_key("fast"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_fork_without_consensus_tolerates_failures() {
    let fork = ForkGroup::new(
        "f",
        vec![
            GraphNode::from_work("m1", ScriptedWork::new("one").with_usage(1, 1).with_delay_ms(5)),
            GraphNode::from_work("m2", ScriptedWork::new("two").with_usage(2, 2).with_delay_ms(30)),
            GraphNode::from_work("m3", FailingWork::new("bad")),
        ],
    )
    .with_min_results(2);
    let recorder = Recorder::new();
    let nodes = vec![
        scripted("start", "s"),
        recorded("after", ScriptedWork::echo(), &recorder),
    ];
    let edges = vec![Edge::new("start", "f"), Edge::new("f", "after")];
    let exec = GraphExecutor::with_forks(nodes, vec![fork], edges)
        .unwrap()
        .with_config(pool(4));

    let events = collect_events(exec.stream("go")).await;
    let Some(GraphEvent::GraphComplete { result, .. }) = events.last() else {
        panic!("expected graph:complete, got {:?}", event_names(&events));
    };

    let merged = &result.node_results["f"];
    assert_eq!(merged.output, "[m1]: one\n[m2]: two");
    assert_eq!(merged.usage, TokenUsage::new(3, 3));
    assert_eq!(result.usage.total(), 6);
    // Members are not graph nodes
    assert_eq!(result.node_results.len(), 3);
    assert!(recorder.input_of("after").unwrap().contains("[f]: [m1]: one"));

    let counts = event_counts(&events);
    assert_eq!(counts.get("fork:start"), Some(&1));
    assert_eq!(counts.get("fork:partial"), Some(&2));
    assert_eq!(counts.get("fork:complete"), Some(&1));
    assert!(counts.get("consensus:start").is_none());

    let member_error = events.iter().any(|e| {
        matches!(e, GraphEvent::NodeError { node_id, fork_id: Some(f), .. } if node_id == "m3" && f == "f")
    });
    assert!(member_error);
    assert!(position_of(&events, "fork:start", "f").unwrap() < position_of(&events, "fork:complete", "f").unwrap());
}

#[tokio::test]
async fn test_fork_with_consensus() {
    let consensus = JoinConsensus::new().with_usage(5, 5);
    let fork = ForkGroup::new(
        "vote",
        vec![scripted("b", "beta"), scripted("a", "alpha")],
    )
    .with_consensus(Arc::new(consensus.clone()));
    let exec = GraphExecutor::with_forks(vec![], vec![fork], vec![]).unwrap();

    let events = collect_events(exec.stream("go")).await;
    let Some(GraphEvent::GraphComplete { result, .. }) = events.last() else {
        panic!("expected graph:complete, got {:?}", event_names(&events));
    };
    assert_eq!(result.output, "alpha | beta");
    assert_eq!(result.usage.total(), 10);
    assert_eq!(consensus.calls(), 1);

    let start = position_of(&events, "consensus:start", "vote").unwrap();
    let done = position_of(&events, "consensus:result", "vote").unwrap();
    let fork_done = position_of(&events, "fork:complete", "vote").unwrap();
    assert!(fork_done < start && start < done);
}

#[tokio::test]
async fn test_fork_rejects_when_too_many_members_fail() {
    let fork = ForkGroup::new(
        "f",
        vec![
            GraphNode::from_work("m1", FailingWork::new("x")),
            GraphNode::from_work("m2", FailingWork::new("y")),
        ],
    );
    let exec = GraphExecutor::with_forks(vec![], vec![fork], vec![]).unwrap();
    let failure = exec.run("go").await.unwrap_err();
    assert!(matches!(failure.error, BraidError::ForkFailed { ref fork, .. } if fork == "f"));
}

#[tokio::test]
async fn test_consensus_failure_fails_run() {
    let fork = ForkGroup::new("f", vec![scripted("m1", "a"), scripted("m2", "b")])
        .with_consensus(Arc::new(FailingConsensus));
    let exec = GraphExecutor::with_forks(vec![], vec![fork], vec![]).unwrap();
    let failure = exec.run("go").await.unwrap_err();
    assert!(matches!(failure.error, BraidError::Consensus { .. }));
}

#[tokio::test]
async fn test_fork_timeout_keeps_partial_results() {
    let fork = ForkGroup::new(
        "f",
        vec![
            GraphNode::from_work("fast", ScriptedWork::new("quick").with_delay_ms(5)),
            GraphNode::from_work("slow", ScriptedWork::new("late").with_delay_ms(1_000)),
        ],
    )
    .with_timeout_ms(60);
    let exec = GraphExecutor::with_forks(vec![], vec![fork], vec![])
        .unwrap()
        .with_config(pool(2));

    let started = std::time::Instant::now();
    let result = exec.run("go").await.unwrap();
    assert_eq!(result.output, "[fast]: quick");
    assert!(started.elapsed() < Duration::from_millis(800));
}

#[tokio::test]
async fn test_checkpoint_every_fifth_completion() {
    let store = MemoryCheckpointStore::new();
    let (nodes, edges) = chain(&["a", "b", "c", "d", "e", "f"], &Recorder::new());
    let exec = GraphExecutor::new(nodes, edges)
        .unwrap()
        .with_checkpoint_store(Arc::new(store.clone()));

    let events = collect_events(exec.stream("input")).await;
    let checkpoints: Vec<&GraphCheckpoint> = events
        .iter()
        .filter_map(|e| match e {
            GraphEvent::CheckpointSaved { checkpoint, .. } => Some(checkpoint),
            _ => None,
        })
        .collect();
    assert_eq!(checkpoints.len(), 1);
    let cp = checkpoints[0];
    assert_eq!(cp.completed_ids(), vec!["a", "b", "c", "d", "e"]);
    assert_eq!(cp.input, "input");
    assert_eq!(cp.pending.get("f"), Some(&0));

    // Saves run in the background
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.saved().len(), 1);
}

#[tokio::test]
async fn test_checkpoint_store_failure_is_not_fatal() {
    let (nodes, edges) = chain(&["a", "b", "c", "d", "e"], &Recorder::new());
    let exec = GraphExecutor::new(nodes, edges)
        .unwrap()
        .with_checkpoint_store(Arc::new(FailingCheckpointStore));
    let result = exec.run("go").await.unwrap();
    assert_eq!(result.output, "out-e");
}

#[tokio::test]
async fn test_resume_from_checkpoint_skips_completed_nodes() {
    let ids = ["a", "b", "c", "d", "e", "f"];
    let (nodes, edges) = chain(&ids, &Recorder::new());
    let config = EngineConfig {
        executor: ExecutorConfig {
            checkpoint_every: 2,
            ..ExecutorConfig::default()
        },
        ..EngineConfig::default()
    };
    let first = GraphExecutor::new(nodes, edges).unwrap().with_config(config.clone());
    let events = collect_events(first.stream("go")).await;
    let checkpoint = events
        .iter()
        .find_map(|e| match e {
            GraphEvent::CheckpointSaved { checkpoint, .. } => Some(checkpoint.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(checkpoint.completed_ids(), vec!["a", "b"]);

    let recorder = Recorder::new();
    let (nodes, edges) = chain(&ids, &recorder);
    let second = GraphExecutor::new(nodes, edges).unwrap().with_config(config);
    let result = second.resume(checkpoint.clone()).await.unwrap();

    assert_eq!(recorder.starts(), vec!["c", "d", "e", "f"]);
    assert_eq!(result.node_results.len(), 6);
    assert_eq!(result.run_id, checkpoint.run_id);
    assert_eq!(result.output, "out-f");
    // c still sees b's output carried over from the checkpoint
    assert!(recorder.input_of("c").unwrap().contains("[b]: out-b"));
}

fn fork_graph() -> GraphExecutor {
    let fork = ForkGroup::new(
        "f",
        vec![
            GraphNode::from_work("m1", ScriptedWork::new("one").with_usage(5, 5).with_delay_ms(5)),
            GraphNode::from_work("m2", ScriptedWork::new("two").with_usage(1, 1).with_delay_ms(150)),
        ],
    );
    let nodes = vec![
        GraphNode::from_work("a", ScriptedWork::new("a").with_usage(1, 0)),
        GraphNode::from_work("x", ScriptedWork::new("x").with_usage(0, 2).with_delay_ms(40)),
    ];
    let config = EngineConfig {
        executor: ExecutorConfig {
            checkpoint_every: 2,
            ..ExecutorConfig::default()
        },
        ..pool(4)
    };
    GraphExecutor::with_forks(nodes, vec![fork], vec![Edge::new("a", "f")])
        .unwrap()
        .with_config(config)
}

#[tokio::test]
async fn test_checkpoint_leaves_out_usage_of_open_forks() {
    let events = collect_events(fork_graph().stream("go")).await;
    let checkpoint = events
        .iter()
        .find_map(|e| match e {
            GraphEvent::CheckpointSaved { checkpoint, .. } => Some(checkpoint.clone()),
            _ => None,
        })
        .unwrap();
    // m1 had finished, but its fork had not
    assert_eq!(checkpoint.completed_ids(), vec!["a", "x"]);
    assert_eq!(checkpoint.usage, TokenUsage::new(1, 2));

    let result = fork_graph().resume(checkpoint).await.unwrap();
    assert_eq!(result.usage, TokenUsage::new(7, 8));
    assert_eq!(result.node_results["f"].usage, TokenUsage::new(6, 6));
}

#[tokio::test]
async fn test_resume_with_inconsistent_counts_deadlocks() {
    let nodes = vec![scripted("a", "x"), scripted("b", "y")];
    let exec = GraphExecutor::new(nodes, vec![Edge::new("a", "b")]).unwrap();

    let mut completed = HashMap::new();
    completed.insert(
        "a".to_string(),
        NodeResult {
            node_id: "a".into(),
            output: "x".into(),
            usage: TokenUsage::default(),
            elapsed_ms: 1,
        },
    );
    let mut pending = HashMap::new();
    pending.insert("a".to_string(), 0);
    pending.insert("b".to_string(), 1);
    let checkpoint = GraphCheckpoint {
        run_id: "r1".into(),
        input: "go".into(),
        completed,
        pending,
        usage: TokenUsage::default(),
        elapsed_ms: 0,
        timestamp: Utc::now(),
    };

    let failure = exec.resume(checkpoint).await.unwrap_err();
    assert!(matches!(failure.error, BraidError::Deadlock { completed: 1, total: 2 }));
    assert!(failure.to_string().contains("deadlock"));
    assert!(failure.partial_results.contains_key("a"));
}

#[tokio::test]
async fn test_resume_rejects_unknown_nodes() {
    let exec = GraphExecutor::new(vec![scripted("a", "x")], vec![]).unwrap();
    let mut completed = HashMap::new();
    completed.insert(
        "ghost".to_string(),
        NodeResult {
            node_id: "ghost".into(),
            output: String::new(),
            usage: TokenUsage::default(),
            elapsed_ms: 0,
        },
    );
    let checkpoint = GraphCheckpoint {
        run_id: "r".into(),
        input: "go".into(),
        completed,
        pending: HashMap::new(),
        usage: TokenUsage::default(),
        elapsed_ms: 0,
        timestamp: Utc::now(),
    };
    let events = collect_events(exec.resume_stream(checkpoint)).await;
    assert_eq!(event_names(&events), vec!["graph:error"]);
}

#[tokio::test]
async fn test_events_published_on_bus() {
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();
    let exec = GraphExecutor::new(vec![scripted("a", "x")], vec![])
        .unwrap()
        .with_event_bus(bus.clone());

    exec.run("go").await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec!["graph:start", "node:start", "node:complete", "graph:complete"]
    );
}
