use crate::cache::CacheKey;
use crate::context::{ExecutionContext, RunOptions};
use crate::dag::DependencyGraph;
use crate::error::{DagError, Result};
use crate::node::{Compute, Node};
use crate::types::NodeInputs;
use crate::validation;
use anyhow::anyhow;
use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

/// Target name to computed value, in target order
pub type Outputs = IndexMap<String, Value>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Call the node body and check its output. A panicking body is reported as a node failure.
fn call_blocking(node: &Node, inputs: &NodeInputs) -> Result<Value> {
    tracing::debug!("Computing node {}", node.name());

    let value = match node.compute() {
        Compute::Sync(f) => panic::catch_unwind(AssertUnwindSafe(|| f(inputs)))
            .unwrap_or_else(|payload| Err(anyhow!("node panicked: {}", panic_message(&*payload)))),
        Compute::Async(_) => {
            return Err(DagError::AsyncNodeInSequentialRun {
                target: node.name().to_string(),
                node: node.name().to_string(),
            })
        }
    }
    .map_err(|source| DagError::NodeExecution {
        node: node.name().to_string(),
        source,
    })?;

    validation::validate_output(node, &value)?;
    Ok(value)
}

async fn call(node: &Node, inputs: NodeInputs) -> Result<Value> {
    tracing::debug!("Computing node {}", node.name());

    let value = match node.compute() {
        Compute::Sync(f) => f(&inputs),
        Compute::Async(f) => f(inputs).await,
    }
    .map_err(|source| DagError::NodeExecution {
        node: node.name().to_string(),
        source,
    })?;

    validation::validate_output(node, &value)?;
    Ok(value)
}

/// Invoke a node on resolved inputs, going through its cache when enabled
pub(crate) fn invoke_blocking(node: &Node, inputs: NodeInputs, use_cache: bool) -> Result<Value> {
    validation::validate_inputs(node, &inputs)?;

    if use_cache && node.options().cache {
        let key = CacheKey::from_inputs(&inputs);
        return node
            .cache_store()
            .get_or_compute(key, || call_blocking(node, &inputs));
    }
    call_blocking(node, &inputs)
}

pub(crate) async fn invoke_async(node: &Node, inputs: NodeInputs, use_cache: bool) -> Result<Value> {
    validation::validate_inputs(node, &inputs)?;

    if use_cache && node.options().cache {
        let key = CacheKey::from_inputs(&inputs);
        return node
            .cache_store()
            .get_or_compute_async(key, || call(node, inputs))
            .await;
    }
    call(node, inputs).await
}

/// Resolve a node's inputs from the context, invoke it and record its result
pub fn invoke(graph: &DependencyGraph, node: &Node, ctx: &mut ExecutionContext) -> Result<Value> {
    let resolved = ctx.resolve_inputs(graph, node)?;
    tracing::debug!("Invoking node {} in run {}", node.name(), ctx.run_id());

    let value = invoke_blocking(node, resolved, ctx.options().enable_cache)?;
    ctx.record(node, value.clone());
    Ok(value)
}

/// Run a node on the runtime: sync bodies on the blocking pool, async bodies as a task
async fn dispatch(node: Node, inputs: NodeInputs, use_cache: bool) -> Result<Value> {
    let name = node.name().to_string();
    let handle = if node.is_async() {
        tokio::spawn(async move { invoke_async(&node, inputs, use_cache).await })
    } else {
        tokio::task::spawn_blocking(move || invoke_blocking(&node, inputs, use_cache))
    };

    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(DagError::NodeExecution {
            node: name,
            source: anyhow!("node panicked: {}", panic_message(&*err.into_panic())),
        }),
        Err(err) => Err(DagError::NodeExecution {
            node: name,
            source: anyhow!("node task did not complete: {}", err),
        }),
    }
}

fn target_names(graph: &DependencyGraph) -> Vec<String> {
    graph
        .targets()
        .iter()
        .map(|t| t.name().to_string())
        .collect()
}

fn collect_outputs(graph: &DependencyGraph, ctx: &ExecutionContext) -> Result<Outputs> {
    graph
        .targets()
        .into_iter()
        .map(|target| {
            let value = ctx.result(&target).cloned().ok_or_else(|| DagError::NodeExecution {
                node: target.name().to_string(),
                source: anyhow!("run finished without a result for this target"),
            })?;
            Ok((target.name().to_string(), value))
        })
        .collect()
}

pub(crate) fn single_output(mut outputs: Outputs, name: &str) -> Result<Value> {
    outputs
        .shift_remove(name)
        .ok_or_else(|| DagError::NodeExecution {
            node: name.to_string(),
            source: anyhow!("run finished without a result for this target"),
        })
}

fn log_outcome(ctx: &ExecutionContext, started: Instant, result: &Result<()>) {
    match result {
        Ok(()) => tracing::info!(
            "Run completed: run_id={}, nodes={}, duration_ms={}",
            ctx.run_id(),
            ctx.completed(),
            started.elapsed().as_millis()
        ),
        Err(e) => tracing::warn!(
            "Run aborted: run_id={}, completed_nodes={}, error={}",
            ctx.run_id(),
            ctx.completed(),
            e
        ),
    }
}

/// Execute the graph sequentially in topological order.
///
/// Refuses graphs containing async nodes before anything runs. Stops at the first failing node.
pub fn execute(graph: &DependencyGraph, inputs: NodeInputs, options: RunOptions) -> Result<Outputs> {
    if let Some(node) = graph.first_async() {
        return Err(DagError::AsyncNodeInSequentialRun {
            target: target_names(graph).join(", "),
            node: node.name().to_string(),
        });
    }

    let mut ctx = ExecutionContext::new(inputs, options);
    let order = graph.topological_order();
    let started = Instant::now();

    tracing::info!(
        "Starting sequential run: run_id={}, targets={:?}, nodes={}",
        ctx.run_id(),
        target_names(graph),
        order.len()
    );

    let result = order
        .iter()
        .try_for_each(|node| invoke(graph, node, &mut ctx).map(|_| ()));

    log_outcome(&ctx, started, &result);
    result?;
    collect_outputs(graph, &ctx)
}

/// Execute the graph layer by layer, dispatching each layer's nodes concurrently.
///
/// The next layer starts only once every node of the current one finished. If any node of a
/// layer fails, its siblings still run to completion but no further layer is dispatched; the
/// first failure in declaration order is returned.
pub async fn execute_concurrent(
    graph: &DependencyGraph,
    inputs: NodeInputs,
    options: RunOptions,
) -> Result<Outputs> {
    let mut ctx = ExecutionContext::new(inputs, options);
    let layers = graph.ready_layers();
    let started = Instant::now();

    tracing::info!(
        "Starting concurrent run: run_id={}, targets={:?}, nodes={}, layers={}",
        ctx.run_id(),
        target_names(graph),
        graph.len(),
        layers.len()
    );

    let result = run_layers(graph, &layers, &mut ctx).await;

    log_outcome(&ctx, started, &result);
    result?;
    collect_outputs(graph, &ctx)
}

async fn run_layers(
    graph: &DependencyGraph,
    layers: &[Vec<Node>],
    ctx: &mut ExecutionContext,
) -> Result<()> {
    let use_cache = ctx.options().enable_cache;

    for (depth, layer) in layers.iter().enumerate() {
        // Bind the whole layer before dispatching any of it
        let resolved = layer
            .iter()
            .map(|node| ctx.resolve_inputs(graph, node))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "Dispatching layer {} ({} nodes) in run {}",
            depth,
            layer.len(),
            ctx.run_id()
        );

        let outcomes = join_all(
            layer
                .iter()
                .cloned()
                .zip(resolved)
                .map(|(node, inputs)| dispatch(node, inputs, use_cache)),
        )
        .await;

        let mut failure = None;
        for (node, outcome) in layer.iter().zip(outcomes) {
            match outcome {
                Ok(value) => ctx.record(node, value),
                Err(err) if failure.is_none() => failure = Some(err),
                Err(err) => tracing::debug!("Additional failure in layer {}: {}", depth, err),
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
    }

    Ok(())
}

/// Execute the graph off the calling task and wait for the outcome.
///
/// Graphs without async nodes run sequentially on the blocking pool; others run concurrently on
/// a spawned task. Failures come back unchanged.
pub async fn execute_on_worker(
    graph: DependencyGraph,
    inputs: NodeInputs,
    options: RunOptions,
) -> Result<Outputs> {
    let joined = if graph.has_async() {
        tokio::spawn(async move { execute_concurrent(&graph, inputs, options).await }).await
    } else {
        tokio::task::spawn_blocking(move || execute(&graph, inputs, options)).await
    };

    joined.map_err(|e| DagError::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Detached;
    use crate::types::ValueKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    /// a()->1, b(a)->a+1, c(a)->a*2, d(b,c)->b+c
    fn diamond(calls: Arc<AtomicUsize>) -> Node {
        let a = Node::builder("a")
            .cache(false)
            .build(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(1))
            })
            .unwrap();
        let b = Node::builder("b")
            .depends_on(&a)
            .build(|i| Ok(json!(i.i64("a")? + 1)))
            .unwrap();
        let c = Node::builder("c")
            .depends_on(&a)
            .build(|i| Ok(json!(i.i64("a")? * 2)))
            .unwrap();
        Node::builder("d")
            .depends_on(&b)
            .depends_on(&c)
            .build(|i| Ok(json!(i.i64("b")? + i.i64("c")?)))
            .unwrap()
    }

    #[test]
    fn test_diamond_sequential() {
        let calls = counter();
        let d = diamond(calls.clone());
        let graph = DependencyGraph::build(&[d], &Detached).unwrap();

        let outputs = execute(&graph, NodeInputs::new(), RunOptions::default()).unwrap();
        assert_eq!(outputs["d"], json!(4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_diamond_concurrent() {
        let calls = counter();
        let d = diamond(calls.clone());
        let graph = DependencyGraph::build(&[d], &Detached).unwrap();

        let outputs = execute_concurrent(&graph, NodeInputs::new(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outputs["d"], json!(4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_stops_sequential_run() {
        let ran_after = counter();
        let flag = ran_after.clone();

        let boom = Node::builder("boom")
            .build(|_| Err(anyhow!("exploded")))
            .unwrap();
        let after = Node::builder("after")
            .depends_on(&boom)
            .build(move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .unwrap();
        let graph = DependencyGraph::build(&[after], &Detached).unwrap();

        let err = execute(&graph, NodeInputs::new(), RunOptions::default()).unwrap_err();
        match err {
            DagError::NodeExecution { node, source } => {
                assert_eq!(node, "boom");
                assert_eq!(source.to_string(), "exploded");
            }
            other => panic!("expected node failure, got {other:?}"),
        }
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_layer_failure_lets_siblings_finish_and_stops_next_layer() {
        let sibling_done = counter();
        let next_layer = counter();
        let sibling_flag = sibling_done.clone();
        let next_flag = next_layer.clone();

        let failing = Node::builder("failing")
            .build_async(|_| async { Err(anyhow!("layer zero failure")) })
            .unwrap();
        let slow = Node::builder("slow")
            .build_async(move |_| {
                let flag = sibling_flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("done"))
                }
            })
            .unwrap();
        let next = Node::builder("next")
            .depends_on(&failing)
            .depends_on(&slow)
            .build(move |_| {
                next_flag.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .unwrap();
        let graph = DependencyGraph::build(&[next], &Detached).unwrap();

        let err = execute_concurrent(&graph, NodeInputs::new(), RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.node(), Some("failing"));
        assert_eq!(sibling_done.load(Ordering::SeqCst), 1);
        assert_eq!(next_layer.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_independent_nodes_run_in_parallel() {
        let delay = Duration::from_millis(300);
        let slow_a = Node::builder("slow_a")
            .build_async(move |_| async move {
                tokio::time::sleep(delay).await;
                Ok(json!("A"))
            })
            .unwrap();
        let slow_b = Node::builder("slow_b")
            .build(move |_| {
                std::thread::sleep(delay);
                Ok(json!("B"))
            })
            .unwrap();
        let graph = DependencyGraph::build(&[slow_a, slow_b], &Detached).unwrap();

        let started = Instant::now();
        let outputs = execute_concurrent(&graph, NodeInputs::new(), RunOptions::default())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outputs["slow_a"], json!("A"));
        assert_eq!(outputs["slow_b"], json!("B"));
        assert!(elapsed >= delay);
        assert!(elapsed < delay * 2, "took {elapsed:?}, expected about one delay");
    }

    #[test]
    fn test_sequential_rejects_async_nodes() {
        let fetch = Node::builder("fetch")
            .build_async(|_| async { Ok(json!(1)) })
            .unwrap();
        let top = Node::builder("top").depends_on(&fetch).build(|_| Ok(json!(2))).unwrap();
        let graph = DependencyGraph::build(&[top], &Detached).unwrap();

        let err = execute(&graph, NodeInputs::new(), RunOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            DagError::AsyncNodeInSequentialRun { ref target, ref node } if target == "top" && node == "fetch"
        ));
    }

    #[test]
    fn test_cache_hit_skips_compute_across_runs() {
        let calls = counter();
        let seen = calls.clone();
        let square = Node::builder("square")
            .input("n", ValueKind::Integer)
            .build(move |i| {
                seen.fetch_add(1, Ordering::SeqCst);
                let n = i.i64("n")?;
                Ok(json!(n * n))
            })
            .unwrap();
        let graph = DependencyGraph::build(&[square.clone()], &Detached).unwrap();

        for _ in 0..2 {
            let out = execute(&graph, NodeInputs::new().with("n", 3), RunOptions::default()).unwrap();
            assert_eq!(out["square"], json!(9));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        execute(&graph, NodeInputs::new().with("n", 4), RunOptions::default()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Disabling the cache at call time bypasses stored entries
        execute(&graph, NodeInputs::new().with("n", 3), RunOptions::without_cache()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = square.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn test_uncached_node_computes_every_run() {
        let calls = counter();
        let seen = calls.clone();
        let tick = Node::builder("tick")
            .cache(false)
            .build(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(json!(true))
            })
            .unwrap();
        let graph = DependencyGraph::build(&[tick], &Detached).unwrap();

        for _ in 0..3 {
            execute(&graph, NodeInputs::new(), RunOptions::default()).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_output_validation_failure_is_not_cached() {
        let calls = counter();
        let seen = calls.clone();
        let bad = Node::builder("bad")
            .returns(ValueKind::Integer)
            .build(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(json!("text"))
            })
            .unwrap();
        let graph = DependencyGraph::build(&[bad.clone()], &Detached).unwrap();

        for _ in 0..2 {
            let err = execute(&graph, NodeInputs::new(), RunOptions::default()).unwrap_err();
            assert!(matches!(err, DagError::Validation { .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bad.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_panicking_node_becomes_node_error() {
        let panics = Node::builder("panics")
            .build(|_| -> anyhow::Result<Value> { panic!("bad arithmetic") })
            .unwrap();
        let graph = DependencyGraph::build(&[panics.clone()], &Detached).unwrap();

        let concurrent = execute_concurrent(&graph, NodeInputs::new(), RunOptions::default())
            .await
            .unwrap_err();
        let sequential = execute(&graph, NodeInputs::new(), RunOptions::default()).unwrap_err();

        for err in [&concurrent, &sequential] {
            assert!(matches!(err, DagError::NodeExecution { ref node, .. } if node == "panics"));
            assert!(err.to_string().contains("node panicked: bad arithmetic"), "{err}");
        }
        assert_eq!(panics.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_panicking_async_node_becomes_node_error() {
        let panics = Node::builder("panics_async")
            .build_async(|_| async move {
                if true {
                    panic!("lost connection");
                }
                Ok::<_, anyhow::Error>(json!(null))
            })
            .unwrap();
        let graph = DependencyGraph::build(&[panics], &Detached).unwrap();

        let err = execute_concurrent(&graph, NodeInputs::new(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DagError::NodeExecution { ref node, .. } if node == "panics_async"));
        assert!(err.to_string().contains("node panicked: lost connection"));
    }

    #[tokio::test]
    async fn test_panicking_node_on_worker_is_a_node_error() {
        let panics = Node::builder("panics_on_worker")
            .build(|_| -> anyhow::Result<Value> { panic!("bad arithmetic") })
            .unwrap();
        let graph = DependencyGraph::build(&[panics], &Detached).unwrap();

        let err = execute_on_worker(graph, NodeInputs::new(), RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.node(), Some("panics_on_worker"));
    }

    #[tokio::test]
    async fn test_worker_runs_and_propagates_errors() {
        let calls = counter();
        let d = diamond(calls);
        let graph = DependencyGraph::build(&[d], &Detached).unwrap();
        let outputs = execute_on_worker(graph, NodeInputs::new(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outputs["d"], json!(4));

        let explode = Node::builder("explode")
            .build_async(|_| async { Err(anyhow!("async boom")) })
            .unwrap();
        let graph = DependencyGraph::build(&[explode], &Detached).unwrap();
        let err = execute_on_worker(graph, NodeInputs::new(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("async boom"));
    }
}
