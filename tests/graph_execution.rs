use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::executor::block_on;
use taskgraph::restriction::WeakLeafsOfEndNodeRestrictingStrategy;
use taskgraph::{
    BuildError, CancellationToken, DependencyDag, EagerTaskGraphExecutor, ExecutionError,
    ExecutionResultType, GraphError, NodeKey, NodeOutcome, OperationCanceled, RayonTaskExecutor,
    ResultError, TaskFactoryGroupConfigurer, TaskFactoryKey, TaskGraphDefConfigurer,
    TaskGraphExecutionResult, TaskGraphExecutor, TaskGraphExecutors, TaskNode, TaskNodeKey,
    node_task,
};

fn chain() -> TaskFactoryKey<String, u32> {
    TaskFactoryKey::with_custom_key("chain")
}

/// Node `n` appends `n` to the result of node `n - 1`.
fn define_chain(configurer: &mut TaskGraphDefConfigurer, group: TaskFactoryGroupConfigurer) {
    configurer
        .factory_group_definer(group)
        .define_simple_factory(chain(), |_, args| {
            let n = *args.factory_arg();
            let previous = match n {
                0 => None,
                n => Some(args.bind_input(&TaskNodeKey::new(chain(), n - 1))?),
            };
            Ok(node_task(move |_| match previous {
                Some(previous) => Ok(format!("{}.{n}", previous.consume_input()?)),
                None => Ok("0".to_string()),
            }))
        });
}

fn build(
    configurer: &TaskGraphDefConfigurer,
    keys: &[NodeKey],
) -> Result<Box<dyn TaskGraphExecutor>, BuildError> {
    let mut builder = configurer.build();
    for key in keys {
        builder.add_node(key.clone()).unwrap();
    }
    block_on(builder.build_graph(&CancellationToken::new()))
}

fn execute(
    mut executor: Box<dyn TaskGraphExecutor>,
    results: &[NodeKey],
) -> Result<TaskGraphExecutionResult, ExecutionError> {
    executor.properties().add_result_node_keys(results.iter().cloned());
    block_on(executor.execute(&CancellationToken::new()))
}

#[test]
fn computes_chain() {
    let mut configurer = TaskGraphDefConfigurer::new();
    define_chain(&mut configurer, TaskFactoryGroupConfigurer::default());

    let key = TaskNodeKey::new(chain(), 3);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let result = execute(executor, &[key.erase()]).unwrap();

    assert!(result.is_fully_completed());
    assert_eq!(*result.get_result(&key).unwrap(), "0.1.2.3");
}

#[test]
fn eager_executor_computes_chain() {
    let mut configurer = TaskGraphDefConfigurer::new();
    define_chain(&mut configurer, TaskFactoryGroupConfigurer::default());
    configurer.with_executor_factory(TaskGraphExecutors::eager());

    let key = TaskNodeKey::new(chain(), 5);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let result = execute(executor, &[key.erase()]).unwrap();
    assert_eq!(*result.get_result(&key).unwrap(), "0.1.2.3.4.5");
}

#[test]
fn long_chain_on_thread_pool() {
    let mut configurer = TaskGraphDefConfigurer::new();
    define_chain(
        &mut configurer,
        TaskFactoryGroupConfigurer::new(|props| {
            props.set_factory_executor(RayonTaskExecutor::new());
            props.default_node_properties().set_executor(RayonTaskExecutor::new());
        }),
    );

    let key = TaskNodeKey::new(chain(), 2_000);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let result = execute(executor, &[key.erase()]).unwrap();

    let value = result.get_result(&key).unwrap();
    assert!(value.starts_with("0.1.2."));
    assert!(value.ends_with(".1999.2000"));
}

/// Node `n` adds one to node `n - 1`.
fn define_counter(configurer: &mut TaskGraphDefConfigurer) -> TaskFactoryKey<u64, u32> {
    let counter = TaskFactoryKey::<u64, u32>::with_custom_key("counter");
    let input = counter.clone();
    configurer
        .factory_group_definer(TaskFactoryGroupConfigurer::default())
        .define_simple_factory(counter.clone(), move |_, args| {
            let previous = match *args.factory_arg() {
                0 => None,
                n => Some(args.bind_input(&TaskNodeKey::new(input.clone(), n - 1))?),
            };
            Ok(node_task(move |_| match previous {
                Some(previous) => Ok(*previous.consume_input()? + 1),
                None => Ok(0),
            }))
        });
    counter
}

#[test]
fn long_chain_on_default_executors() {
    let mut configurer = TaskGraphDefConfigurer::new();
    let counter = define_counter(&mut configurer);

    let key = TaskNodeKey::new(counter, 20_000);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let result = execute(executor, &[key.erase()]).unwrap();

    assert!(result.is_fully_completed());
    assert_eq!(*result.get_result(&key).unwrap(), 20_000);
}

#[test]
fn long_chain_on_eager_executor() {
    let mut configurer = TaskGraphDefConfigurer::new();
    let counter = define_counter(&mut configurer);
    configurer.with_executor_factory(TaskGraphExecutors::eager());

    let key = TaskNodeKey::new(counter, 20_000);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let result = execute(executor, &[key.erase()]).unwrap();
    assert_eq!(*result.get_result(&key).unwrap(), 20_000);
}

#[test]
fn unexecuted_long_chain_can_be_dropped() {
    let mut configurer = TaskGraphDefConfigurer::new();
    let counter = define_counter(&mut configurer);

    // Dependencies first: each node is released while its dependent still
    // holds it, leaving the whole chain to the last one.
    configurer.with_executor_factory(Arc::new(
        |graph: DependencyDag<NodeKey>,
         mut nodes: Vec<Arc<TaskNode>>|
         -> anyhow::Result<Box<dyn TaskGraphExecutor>> {
            nodes.reverse();
            Ok(Box::new(EagerTaskGraphExecutor::new(graph, nodes)))
        },
    ));

    let key = TaskNodeKey::new(counter, 20_000);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    drop(executor);
}

#[test]
fn shared_dependency_is_computed_once() {
    let shared = TaskFactoryKey::<Vec<u32>, ()>::new();
    let user = TaskFactoryKey::<usize, u32>::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut configurer = TaskGraphDefConfigurer::new();
    let mut definer = configurer.factory_group_definer(TaskFactoryGroupConfigurer::default());
    let counted = Arc::clone(&runs);
    definer.define_simple_factory(shared.clone(), move |_, _| {
        let counted = Arc::clone(&counted);
        Ok(node_task(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2, 3])
        }))
    });
    let input = shared.clone();
    definer.define_simple_factory(user.clone(), move |_, args| {
        let shared = args.bind_input(&TaskNodeKey::new(input.clone(), ()))?;
        Ok(node_task(move |_| {
            let shared = shared.consume_input()?;
            Ok(Arc::as_ptr(&shared) as usize)
        }))
    });

    let first = TaskNodeKey::new(user.clone(), 1);
    let second = TaskNodeKey::new(user, 2);
    let executor = build(&configurer, &[first.erase(), second.erase()]).unwrap();
    let result = execute(executor, &[first.erase(), second.erase()]).unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(result.get_result(&first).unwrap(), result.get_result(&second).unwrap());
}

#[test]
fn input_can_be_consumed_once() {
    let source = TaskFactoryKey::<u32, ()>::new();
    let reader = TaskFactoryKey::<bool, ()>::new();

    let mut configurer = TaskGraphDefConfigurer::new();
    let mut definer = configurer.factory_group_definer(TaskFactoryGroupConfigurer::default());
    definer.define_simple_factory(source.clone(), |_, _| Ok(node_task(|_| Ok(7))));
    let input = source.clone();
    definer.define_simple_factory(reader.clone(), move |_, args| {
        let value = args.bind_input(&TaskNodeKey::new(input.clone(), ()))?;
        Ok(node_task(move |_| {
            assert_eq!(*value.consume_input()?, 7);
            Ok(matches!(value.consume_input(), Err(ResultError::InputConsumed(_))))
        }))
    });

    let key = TaskNodeKey::new(reader, ());
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let result = execute(executor, &[key.erase()]).unwrap();
    assert!(*result.get_result(&key).unwrap());
}

#[test]
fn missing_input_factory_fails_build() {
    let undefined = TaskFactoryKey::<u32, u32>::new();
    let mut configurer = TaskGraphDefConfigurer::new();
    configurer
        .factory_group_definer(TaskFactoryGroupConfigurer::default())
        .define_simple_factory(TaskFactoryKey::<u32, ()>::new(), move |_, args| {
            let input = args.bind_input(&TaskNodeKey::new(undefined.clone(), 0))?;
            Ok(node_task(move |_| Ok(*input.consume_input()?)))
        });

    let key = TaskNodeKey::new(TaskFactoryKey::<u32, ()>::new(), ());
    let err = match build(&configurer, &[key.erase()]) {
        Err(err) => err,
        Ok(_) => panic!("build should fail"),
    };

    match err {
        BuildError::NodeCreate { key: failed, error } => {
            assert_eq!(failed, key.erase());
            assert!(matches!(
                error.downcast_ref::<GraphError>(),
                Some(GraphError::MissingFactory(_))
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn dependency_cycle_fails_build() {
    let cyclic = TaskFactoryKey::<u32, bool>::new();
    let mut configurer = TaskGraphDefConfigurer::new();
    let input = cyclic.clone();
    configurer
        .factory_group_definer(TaskFactoryGroupConfigurer::default())
        .define_simple_factory(cyclic.clone(), move |_, args| {
            let other = !*args.factory_arg();
            let input = args.bind_input(&TaskNodeKey::new(input.clone(), other))?;
            Ok(node_task(move |_| Ok(*input.consume_input()?)))
        });

    let key = TaskNodeKey::new(cyclic, true);
    assert!(matches!(
        build(&configurer, &[key.erase()]),
        Err(BuildError::Graph(GraphError::Cyclic(_)))
    ));
}

#[test]
fn canceled_build_does_not_report_errors() {
    let mut configurer = TaskGraphDefConfigurer::new();
    define_chain(&mut configurer, TaskFactoryGroupConfigurer::default());

    let reported = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&reported);
    let mut builder = configurer.build();
    builder.properties().set_node_create_error_handler(move |_, _| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    builder.add_node(&TaskNodeKey::new(chain(), 2)).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        block_on(builder.build_graph(&cancel)),
        Err(BuildError::Canceled)
    ));
    assert_eq!(reported.load(Ordering::SeqCst), 0);
}

/// `broken` fails, `after` depends on it and `independent` depends on
/// nothing. With the default executors nodes run one at a time on the
/// calling thread, in the order they were first requested.
struct FailingGraph {
    configurer: TaskGraphDefConfigurer,
    broken: TaskNodeKey<u32, &'static str>,
    after: TaskNodeKey<u32, &'static str>,
    independent: TaskNodeKey<u32, &'static str>,
}

impl FailingGraph {
    fn new() -> Self {
        let factory = TaskFactoryKey::<u32, &'static str>::new();
        let mut configurer = TaskGraphDefConfigurer::new();
        let input = factory.clone();
        configurer
            .factory_group_definer(TaskFactoryGroupConfigurer::default())
            .define_simple_factory(factory.clone(), move |_, args| match *args.factory_arg() {
                "broken" => Ok(node_task(|_| anyhow::bail!("broken on purpose"))),
                "after" => {
                    let input = args.bind_input(&TaskNodeKey::new(input.clone(), "broken"))?;
                    Ok(node_task(move |_| Ok(*input.consume_input()? + 1)))
                }
                _ => Ok(node_task(|_| Ok(42))),
            });

        Self {
            configurer,
            broken: TaskNodeKey::new(factory.clone(), "broken"),
            after: TaskNodeKey::new(factory.clone(), "after"),
            independent: TaskNodeKey::new(factory, "independent"),
        }
    }

    fn keys(&self) -> Vec<NodeKey> {
        vec![self.after.erase(), self.independent.erase()]
    }

    fn executor(&self) -> Box<dyn TaskGraphExecutor> {
        build(&self.configurer, &self.keys()).unwrap()
    }
}

#[test]
fn failure_is_reported_with_result() {
    let graph = FailingGraph::new();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);

    let mut executor = graph.executor();
    executor
        .properties()
        .set_deliver_result_on_failure(true)
        .add_result_node_key(&graph.broken)
        .set_compute_error_handler(move |key, error| {
            sink.lock().unwrap().push((key.clone(), error.to_string()));
        });
    let result = execute(executor, &graph.keys()).unwrap();

    assert_eq!(result.result_type(), ExecutionResultType::Errored);
    assert_eq!(
        *reported.lock().unwrap(),
        vec![(graph.broken.erase(), "broken on purpose".to_string())]
    );

    let err = result.get_result(&graph.broken).unwrap_err();
    assert_eq!(
        err.node_error().map(ToString::to_string).as_deref(),
        Some("broken on purpose")
    );
    assert!(matches!(result.get_result(&graph.after), Err(ResultError::Canceled(_))));
    assert_eq!(*result.get_result(&graph.independent).unwrap(), 42);
}

#[test]
fn failure_without_result_delivery() {
    let graph = FailingGraph::new();
    assert_eq!(
        execute(graph.executor(), &graph.keys()).unwrap_err(),
        ExecutionError::Failed
    );
}

#[test]
fn stop_on_failure_cancels_remaining_nodes() {
    let graph = FailingGraph::new();
    let mut executor = graph.executor();
    executor
        .properties()
        .set_stop_on_failure(true)
        .set_deliver_result_on_failure(true);
    let result = execute(executor, &graph.keys()).unwrap();

    assert!(result.is_errored());
    assert!(matches!(
        result.outcome(&graph.independent.erase()),
        Some(NodeOutcome::Canceled)
    ));
}

#[test]
fn stop_on_failure_keeps_results_computed_before_the_failure() {
    let graph = FailingGraph::new();
    let keys = vec![graph.independent.erase(), graph.after.erase()];
    let mut executor = build(&graph.configurer, &keys).unwrap();
    executor
        .properties()
        .set_stop_on_failure(true)
        .set_deliver_result_on_failure(true);
    let result = execute(executor, &keys).unwrap();

    assert_eq!(result.result_type(), ExecutionResultType::Errored);
    assert_eq!(*result.get_result(&graph.independent).unwrap(), 42);
    assert!(matches!(result.get_result(&graph.after), Err(ResultError::Canceled(_))));
}

#[test]
fn canceling_from_a_task_is_not_an_error() {
    let mut configurer = TaskGraphDefConfigurer::new();
    let outer = CancellationToken::new();
    let token = outer.clone();
    let computed = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&computed);
    let factory = TaskFactoryKey::<u32, u32>::new();
    let input = factory.clone();
    configurer
        .factory_group_definer(TaskFactoryGroupConfigurer::new(|props| {
            props.default_node_properties().set_executor(RayonTaskExecutor::new());
        }))
        .define_simple_factory(factory.clone(), move |_, args| {
            let n = *args.factory_arg();
            let previous = match n {
                0 => None,
                n => Some(args.bind_input(&TaskNodeKey::new(input.clone(), n - 1))?),
            };
            let token = token.clone();
            let counted = Arc::clone(&counted);
            Ok(node_task(move |_| {
                if n == 10 {
                    token.cancel();
                    return Err(OperationCanceled.into());
                }
                counted.fetch_add(1, Ordering::SeqCst);
                match previous {
                    Some(previous) => Ok(*previous.consume_input()? + 1),
                    None => Ok(0),
                }
            }))
        });

    let key = TaskNodeKey::new(factory, 100);
    let mut executor = build(&configurer, &[key.erase()]).unwrap();
    let reported = Arc::new(AtomicUsize::new(0));
    let errors = Arc::clone(&reported);
    executor
        .properties()
        .set_compute_error_handler(move |_, _| {
            errors.fetch_add(1, Ordering::SeqCst);
        })
        .add_result_node_key(&key);

    let result = block_on(executor.execute(&outer));
    assert_eq!(result.unwrap_err(), ExecutionError::Canceled);
    assert_eq!(reported.load(Ordering::SeqCst), 0);
    assert_eq!(computed.load(Ordering::SeqCst), 10);
}

#[test]
fn executes_only_once() {
    let mut configurer = TaskGraphDefConfigurer::new();
    define_chain(&mut configurer, TaskFactoryGroupConfigurer::default());

    let key = TaskNodeKey::new(chain(), 1);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let cancel = CancellationToken::new();
    assert!(block_on(executor.execute(&cancel)).is_ok());
    assert_eq!(
        block_on(executor.execute(&cancel)).unwrap_err(),
        ExecutionError::AlreadyExecuted
    );
}

#[test]
fn unrequested_result_is_rejected() {
    let mut configurer = TaskGraphDefConfigurer::new();
    define_chain(&mut configurer, TaskFactoryGroupConfigurer::default());

    let key = TaskNodeKey::new(chain(), 2);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let result = execute(executor, &[key.erase()]).unwrap();
    assert!(matches!(
        result.get_result(&TaskNodeKey::new(chain(), 1)),
        Err(ResultError::NotRequested(_))
    ));
}

#[test]
fn bounded_strategy_releases_end_nodes_in_queue_order() {
    let leaf = TaskFactoryKey::<u32, u32>::with_custom_key("leaf");
    let end = TaskFactoryKey::<u32, u32>::with_custom_key("end");
    let computed_leafs = Arc::new(Mutex::new(Vec::new()));

    let mut configurer = TaskGraphDefConfigurer::new();
    let mut definer = configurer.factory_group_definer(TaskFactoryGroupConfigurer::default());
    let log = Arc::clone(&computed_leafs);
    definer.define_simple_factory(leaf.clone(), move |_, args| {
        let n = *args.factory_arg();
        let log = Arc::clone(&log);
        Ok(node_task(move |_| {
            log.lock().unwrap().push(n);
            Ok(n * 10)
        }))
    });
    let input = leaf.clone();
    definer.define_simple_factory(end.clone(), move |_, args| {
        let n = *args.factory_arg();
        let leaf = args.bind_input(&TaskNodeKey::new(input.clone(), n))?;
        Ok(node_task(move |_| Ok(*leaf.consume_input()? + 1)))
    });

    let strategy = WeakLeafsOfEndNodeRestrictingStrategy::new(NonZeroUsize::MIN).with_queue_sorter(|queue| {
        queue.sort_by_key(|key| std::cmp::Reverse(key.factory_arg::<u32>().copied()));
    });
    configurer.with_executor_factory(TaskGraphExecutors::restrictable(strategy));

    let keys: Vec<_> = (0..5).map(|n| TaskNodeKey::new(end.clone(), n)).collect();
    let erased: Vec<_> = keys.iter().map(TaskNodeKey::erase).collect();
    let executor = build(&configurer, &erased).unwrap();
    let result = execute(executor, &erased).unwrap();

    assert!(result.is_fully_completed());
    for (n, key) in keys.iter().enumerate() {
        assert_eq!(*result.get_result(key).unwrap(), n as u32 * 10 + 1);
    }
    assert_eq!(*computed_leafs.lock().unwrap(), vec![4, 3, 2, 1, 0]);
}

#[test]
fn bounded_strategy_limits_concurrent_leafs_on_dedicated_pool() {
    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap(),
    );
    let leaf = TaskFactoryKey::<u32, u32>::with_custom_key("leaf");
    let end = TaskFactoryKey::<u32, u32>::with_custom_key("end");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut configurer = TaskGraphDefConfigurer::new();
    let mut definer = configurer.factory_group_definer(TaskFactoryGroupConfigurer::new(move |props| {
        props
            .default_node_properties()
            .set_executor(RayonTaskExecutor::with_pool(Arc::clone(&pool)));
    }));
    let (counter, max) = (Arc::clone(&running), Arc::clone(&peak));
    definer.define_simple_factory(leaf.clone(), move |_, args| {
        let n = *args.factory_arg();
        let (counter, max) = (Arc::clone(&counter), Arc::clone(&max));
        Ok(node_task(move |_| {
            let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(2));
            counter.fetch_sub(1, Ordering::SeqCst);
            Ok(n)
        }))
    });
    let input = leaf.clone();
    definer.define_simple_factory(end.clone(), move |_, args| {
        let n = *args.factory_arg();
        let leaf = args.bind_input(&TaskNodeKey::new(input.clone(), n))?;
        Ok(node_task(move |_| Ok(*leaf.consume_input()? * 2)))
    });

    let strategy = WeakLeafsOfEndNodeRestrictingStrategy::new(NonZeroUsize::new(2).unwrap());
    configurer.with_executor_factory(TaskGraphExecutors::restrictable(strategy));

    let keys: Vec<_> = (0..32).map(|n| TaskNodeKey::new(end.clone(), n)).collect();
    let erased: Vec<_> = keys.iter().map(TaskNodeKey::erase).collect();
    let executor = build(&configurer, &erased).unwrap();
    let result = execute(executor, &erased).unwrap();

    assert!(result.is_fully_completed());
    for (n, key) in keys.iter().enumerate() {
        assert_eq!(*result.get_result(key).unwrap(), n as u32 * 2);
    }
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "{peak} leafs ran at once");
}

#[cfg(feature = "tokio")]
#[test]
fn runs_on_tokio_runtime() {
    use taskgraph::TokioTaskExecutor;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .build()
        .unwrap();
    let handle = runtime.handle().clone();

    let mut configurer = TaskGraphDefConfigurer::new();
    define_chain(
        &mut configurer,
        TaskFactoryGroupConfigurer::new(move |props| {
            props
                .default_node_properties()
                .set_executor(TokioTaskExecutor::new(handle.clone()));
        }),
    );

    let key = TaskNodeKey::new(chain(), 50);
    let executor = build(&configurer, &[key.erase()]).unwrap();
    let result = execute(executor, &[key.erase()]).unwrap();
    assert!(result.get_result(&key).unwrap().ends_with(".49.50"));
}
