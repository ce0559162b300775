//! Integration Tests for the Reactive Network
//!
//! These tests drive the network through its public surface only: roots,
//! combinators, observers, scopes and build specifications working
//! together.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::{
    select, ActivationState, BuildSpec, DrainMode, Emitter, Error, LifecycleEvent, Network,
    NetworkConfig, NodeId, State, Subscription, Transition,
};

fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |value: &T| sink.lock().unwrap().push(value.clone()))
}

fn transitions(events: &Mutex<Vec<LifecycleEvent>>, transition: Transition) -> Vec<NodeId> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.transition == transition)
        .map(|event| event.node)
        .collect()
}

/// An external cell that counts its starts and teardowns and exposes the
/// emitter of its current activation.
struct Source {
    state: State<i32>,
    emitter: Arc<Mutex<Option<Emitter<i32>>>>,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl Source {
    fn new(network: &Network, initial: i32) -> Self {
        let emitter: Arc<Mutex<Option<Emitter<i32>>>> = Arc::default();
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let (slot, started, stopped) = (emitter.clone(), starts.clone(), stops.clone());
        let state = network.external_state(initial, move |handle: Emitter<i32>| {
            started.fetch_add(1, Ordering::SeqCst);
            *slot.lock().unwrap() = Some(handle);
            let stopped = stopped.clone();
            Subscription::new(move || {
                stopped.fetch_add(1, Ordering::SeqCst);
            })
        });
        Self {
            state,
            emitter,
            starts,
            stops,
        }
    }

    fn emit(&self, value: i32) -> weft_core::Result<()> {
        let emitter = self.emitter.lock().unwrap().clone();
        emitter.expect("source is not running").emit(value)
    }
}

// Glitch-freedom and exactly-once evaluation

#[test]
fn combine_sees_both_writes_of_a_transaction() {
    let network = Network::new(NetworkConfig::default());
    let a = network.state_input(1);
    let b = network.state_input(10);
    let sum = a.state().combine(b.state(), |x, y| x + y);

    let (seen, record) = recorder();
    let _observer = sum.observe(record);
    assert_eq!(*seen.lock().unwrap(), vec![11]);

    network
        .transaction(|tx| {
            tx.set(&a, 2).set(&b, 20);
        })
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![11, 22]);
}

#[test]
fn combined_observer_never_sees_a_mixed_snapshot() {
    let network = Network::new(NetworkConfig::default());
    let a = network.state_input(0);
    let b = network.state_input(0);
    let pair = a.state().combine(b.state(), |x, y| (*x, *y));

    let (seen, record) = recorder();
    let _observer = pair.observe(record);

    for step in 1..=5 {
        network
            .run_transaction(vec![a.write(step), b.write(step)])
            .unwrap();
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    assert!(seen.iter().all(|(x, y)| x == y));
}

#[test]
fn diamond_derives_the_join_once() {
    let network = Network::new(NetworkConfig::default());
    let a = network.state_input(1);
    let b = a.state().map(|v| v * 2);
    let c = a.state().map(|v| v + 100);

    let evaluations = Arc::new(AtomicI32::new(0));
    let counter = evaluations.clone();
    let d = b.combine(&c, move |b, c| {
        counter.fetch_add(1, Ordering::SeqCst);
        b + c
    });
    let _observer = d.observe(|_| {});
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);

    for value in 2..=4 {
        a.set(value).unwrap();
    }
    assert_eq!(evaluations.load(Ordering::SeqCst), 4);
    assert_eq!(d.sample().unwrap(), 4 * 2 + 104);
}

#[test]
fn unchanged_write_does_not_propagate() {
    let network = Network::new(NetworkConfig::default());
    let a = network.state_input(3);

    let evaluations = Arc::new(AtomicI32::new(0));
    let counter = evaluations.clone();
    let doubled = a.state().map(move |v| {
        counter.fetch_add(1, Ordering::SeqCst);
        v * 2
    });
    let _observer = doubled.observe(|_| {});

    a.set(3).unwrap();
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);
}

#[test]
fn batch_updates_compose_in_order() {
    let network = Network::new(NetworkConfig::default());
    let count = network.state_input(1);

    network
        .transaction(|tx| {
            tx.update(&count, |v| v + 1)
                .update(&count, |v| v * 10)
                .set(&count, 7)
                .update(&count, |v| v - 1);
        })
        .unwrap();
    assert_eq!(count.sample().unwrap(), 6);
}

// Activation lifecycle

#[test]
fn open_then_close_before_any_transaction_activates_nothing() {
    let network = Network::new(NetworkConfig::manual());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    network.set_lifecycle_listener(move |event| sink.lock().unwrap().push(*event));

    let source = Source::new(&network, 0);
    let derived = source.state.map(|v| v + 1);

    let scope = network.open_scope().unwrap();
    let observer = scope.enter(|| derived.observe(|_| {}));
    scope.close().unwrap();
    assert!(observer.is_cancelled());

    network.run_until_quiescent().unwrap();
    assert_eq!(source.starts.load(Ordering::SeqCst), 0);
    assert_eq!(derived.activation_state(), Some(ActivationState::Inactive));
    assert_eq!(source.state.activation_state(), Some(ActivationState::Inactive));
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn closing_the_scope_deactivates_dependents_first() {
    let network = Network::new(NetworkConfig::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    network.set_lifecycle_listener(move |event| sink.lock().unwrap().push(*event));

    let a = Source::new(&network, 0);
    let b = a.state.map(|v| v + 1);
    let c = b.map(|v| v * 2);

    let scope = network.open_scope().unwrap();
    scope.enter(|| c.observe(|_| {}));
    assert_eq!(a.starts.load(Ordering::SeqCst), 1);
    a.emit(5).unwrap();
    assert_eq!(c.sample().unwrap(), 12);

    events.lock().unwrap().clear();
    scope.close().unwrap();
    let order = transitions(&events, Transition::Deactivating);
    assert_eq!(order, vec![c.id(), b.id(), a.state.id()]);
    assert_eq!(transitions(&events, Transition::Deactivated).len(), 3);
    assert_eq!(a.stops.load(Ordering::SeqCst), 1);
    for node in [a.state.id(), b.id(), c.id()] {
        assert_eq!(network.activation_state(node), Some(ActivationState::Inactive));
    }
    assert!(matches!(c.sample(), Err(Error::Inactive { .. })));

    // Observing again rebuilds from the source, starting over.
    events.lock().unwrap().clear();
    let _observer = c.observe(|_| {});
    assert_eq!(a.starts.load(Ordering::SeqCst), 2);
    assert_eq!(
        transitions(&events, Transition::Activated),
        vec![a.state.id(), b.id(), c.id()]
    );
    assert_eq!(c.sample().unwrap(), 2);
}

#[test]
fn shared_upstream_stays_active_while_any_observer_remains() {
    let network = Network::new(NetworkConfig::default());
    let source = Source::new(&network, 1);
    let left = source.state.map(|v| v + 1);
    let right = source.state.map(|v| v - 1);

    let first = left.observe(|_| {});
    let second = right.observe(|_| {});
    assert_eq!(source.starts.load(Ordering::SeqCst), 1);

    first.cancel().unwrap();
    assert_eq!(source.stops.load(Ordering::SeqCst), 0);
    assert_eq!(left.activation_state(), Some(ActivationState::Inactive));
    assert_eq!(source.state.activation_state(), Some(ActivationState::Active));

    second.cancel().unwrap();
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    assert!(matches!(second.cancel(), Err(Error::ObserverCancelled(_))));
}

#[test]
fn resubscribing_from_a_callback_keeps_the_source_running() {
    let network = Network::new(NetworkConfig::default());
    let source = Source::new(&network, 0);
    let trigger = network.event_input::<()>();

    let first = Arc::new(Mutex::new(None));
    let replacement = Arc::new(Mutex::new(None));
    *first.lock().unwrap() = Some(source.state.observe(|_| {}));

    let (state, old, new) = (source.state.clone(), first.clone(), replacement.clone());
    let _swapper = trigger.events().observe(move |_| {
        if let Some(handle) = old.lock().unwrap().take() {
            handle.cancel().unwrap();
            *new.lock().unwrap() = Some(state.observe(|_| {}));
        }
    });

    trigger.emit(()).unwrap();
    assert!(replacement.lock().unwrap().is_some());
    assert_eq!(source.starts.load(Ordering::SeqCst), 1);
    assert_eq!(source.stops.load(Ordering::SeqCst), 0);
    assert_eq!(source.state.activation_state(), Some(ActivationState::Active));
}

#[test]
fn scope_close_cascades_to_children_and_runs_hooks() {
    let network = Network::new(NetworkConfig::default());
    let parent = network.open_scope().unwrap();
    let child = parent.open_child().unwrap();

    let hooks = Arc::new(Mutex::new(Vec::new()));
    let (p, c) = (hooks.clone(), hooks.clone());
    parent.on_close(move || p.lock().unwrap().push("parent")).unwrap();
    child.on_close(move || c.lock().unwrap().push("child")).unwrap();

    let input = network.state_input(0);
    let observer = child.enter(|| input.state().map(|v| v + 1).observe(|_| {}));

    parent.close().unwrap();
    assert!(observer.is_cancelled());
    assert!(!child.is_open());
    assert_eq!(*hooks.lock().unwrap(), vec!["child", "parent"]);
    assert!(matches!(child.close(), Err(Error::ScopeClosed(_))));
}

#[test]
fn retained_scope_needs_every_hold_released() {
    let network = Network::new(NetworkConfig::manual());
    let scope = network.open_scope().unwrap();
    let second = scope.retain().unwrap();

    scope.close().unwrap();
    assert!(second.is_open());
    second.close().unwrap();
    assert!(!scope.is_open());

    // Closing, but not yet torn down.
    assert!(matches!(scope.close(), Err(Error::ScopeOverReleased(_))));
    network.run_until_quiescent().unwrap();
    assert!(matches!(scope.close(), Err(Error::ScopeClosed(_))));
}

#[test]
fn nodes_of_a_closed_scope_are_disposed() {
    let network = Network::new(NetworkConfig::default());
    let scope = network.open_scope().unwrap();
    let input = scope.enter(|| network.state_input(1));
    let before = network.node_count();

    scope.close().unwrap();
    assert_eq!(network.node_count(), before - 1);
    assert!(matches!(input.sample(), Err(Error::Disposed(_))));

    let downstream = input.state().map(|v| v + 1);
    let observer = downstream.observe(|_| {});
    assert!(observer.is_cancelled());
    assert!(matches!(downstream.sample(), Err(Error::Inactive { .. })));
}

#[test]
fn activate_closes_its_scope_on_panic() {
    let network = Network::new(NetworkConfig::default());
    let source = Source::new(&network, 0);

    let state = source.state.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        network.activate(|_| {
            let _observer = state.observe(|_| {});
            panic!("block failed");
        })
    }));
    assert!(outcome.is_err());
    assert_eq!(source.starts.load(Ordering::SeqCst), 1);
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);
}

// Build specifications and switching

#[test]
fn spec_runs_are_independent() {
    let network = Network::new(NetworkConfig::default());
    let counter = BuildSpec::defer(|scope| {
        let clicks = scope.network().event_input::<i32>();
        let total = clicks.events().fold(0, |acc, v| acc + v);
        (clicks, total)
    });

    let first_scope = network.open_scope().unwrap();
    let second_scope = network.open_scope().unwrap();
    let (first_clicks, first_total) = counter.run_in(&first_scope).unwrap();
    let (second_clicks, second_total) = counter.run_in(&second_scope).unwrap();
    assert_ne!(first_total, second_total);

    let _a = first_total.observe(|_| {});
    let _b = second_total.observe(|_| {});
    first_clicks.emit(3).unwrap();
    first_clicks.emit(4).unwrap();
    second_clicks.emit(1).unwrap();

    assert_eq!(first_total.sample().unwrap(), 7);
    assert_eq!(second_total.sample().unwrap(), 1);

    first_scope.close().unwrap();
    second_clicks.emit(1).unwrap();
    assert_eq!(second_total.sample().unwrap(), 2);
}

#[test]
fn select_swaps_subgraphs_in_one_transaction() {
    let network = Network::new(NetworkConfig::default());
    let flag = network.state_input(true);
    let level = network.state_input(5);

    let builds = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let (built, closed) = (builds.clone(), closes.clone());
    let level_state = level.state().clone();
    let boosted = BuildSpec::defer(move |scope| {
        built.fetch_add(1, Ordering::SeqCst);
        let closed = closed.clone();
        scope
            .on_close(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        level_state.map(|v| v + 100)
    });
    let fallback = BuildSpec::defer(|scope| scope.network().constant(-1));

    let chosen = select(flag.state(), boosted, fallback);
    let (seen, record) = recorder();
    let _observer = chosen.observe(record);
    assert_eq!(*seen.lock().unwrap(), vec![105]);

    flag.set(false).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![105, -1]);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // The deselected branch is gone; writes to its input reach nothing.
    level.set(6).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![105, -1]);

    flag.set(true).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![105, -1, 106]);
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[test]
fn switchover_evaluates_upstream_once() {
    let network = Network::new(NetworkConfig::default());
    let flag = network.state_input(false);

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let counted = flag.state().map(move |v| {
        counter.fetch_add(1, Ordering::SeqCst);
        *v
    });
    let chosen = select(
        &counted,
        BuildSpec::defer(|scope| scope.network().constant(1)),
        BuildSpec::defer(|scope| scope.network().constant(0)),
    );
    let (seen, record) = recorder();
    let _observer = chosen.observe(record);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    flag.set(true).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    flag.set(false).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 0]);
}

#[test]
fn selector_write_and_branch_input_in_one_batch() {
    let network = Network::new(NetworkConfig::default());
    let flag = network.state_input(false);
    let level = network.state_input(1);

    let level_state = level.state().clone();
    let chosen = select(
        flag.state(),
        BuildSpec::defer(move |_| level_state.map(|v| v * 10)),
        BuildSpec::defer(|scope| scope.network().constant(0)),
    );
    let (seen, record) = recorder();
    let _observer = chosen.observe(record);

    network
        .run_transaction(vec![flag.write(true), level.write(4)])
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![0, 40]);
}

#[test]
fn failing_build_aborts_the_switch() {
    let network = Network::new(NetworkConfig::default());
    let mode = network.state_input(0_u8);
    let chosen = mode.state().switch_spec(|mode| {
        let mode = *mode;
        BuildSpec::defer(move |scope| {
            if mode == 2 {
                panic!("no branch for mode 2");
            }
            scope.network().constant(i32::from(mode))
        })
    });
    let (seen, record) = recorder();
    let _observer = chosen.observe(record);

    mode.set(1).unwrap();
    let err = mode.set(2).unwrap_err();
    assert!(matches!(err, Error::Build { node, .. } if node == chosen.id()));
    assert_eq!(mode.sample().unwrap(), 1);
    assert_eq!(chosen.sample().unwrap(), 1);

    mode.set(0).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 0]);
}

#[test]
fn flatten_follows_the_selected_cell() {
    let network = Network::new(NetworkConfig::default());
    let a = network.state_input(1);
    let b = network.state_input(2);
    let selected = network.state_input(a.state().clone());
    let current = selected.state().flatten();

    let (seen, record) = recorder();
    let _observer = current.observe(record);

    a.set(10).unwrap();
    selected.set(b.state().clone()).unwrap();
    a.set(11).unwrap();
    b.set(3).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 10, 2, 3]);
    assert_eq!(a.state().activation_state(), Some(ActivationState::Inactive));
}

#[test]
fn deactivated_switch_rebuilds_on_reactivation() {
    let network = Network::new(NetworkConfig::default());
    let flag = network.state_input(true);
    let builds = Arc::new(AtomicUsize::new(0));
    let built = builds.clone();
    let chosen = select(
        flag.state(),
        BuildSpec::defer(move |scope| {
            built.fetch_add(1, Ordering::SeqCst);
            scope.network().constant(1)
        }),
        BuildSpec::defer(|scope| scope.network().constant(2)),
    );

    let observer = chosen.observe(|_| {});
    observer.cancel().unwrap();
    let _again = chosen.observe(|_| {});

    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(chosen.sample().unwrap(), 1);
}

// Streams and external sources

#[test]
fn external_events_start_and_stop_with_observers() {
    let network = Network::new(NetworkConfig::default());
    let registered: Arc<Mutex<Option<Emitter<&'static str>>>> = Arc::default();
    let stops = Arc::new(AtomicUsize::new(0));

    let (slot, stopped) = (registered.clone(), stops.clone());
    let messages = network.external_events(move |emitter: Emitter<&'static str>| {
        *slot.lock().unwrap() = Some(emitter);
        let stopped = stopped.clone();
        Subscription::new(move || {
            stopped.fetch_add(1, Ordering::SeqCst);
        })
    });
    let shouted = messages.map(|m| m.to_uppercase());
    let (seen, record) = recorder();
    let observer = shouted.observe(record);

    let emitter = registered.lock().unwrap().clone().unwrap();
    emitter.emit("hi").unwrap();
    observer.cancel().unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    // Accepted, then dropped by the transaction: the source is inactive.
    emitter.emit("late").unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["HI".to_string()]);
}

#[test]
fn emitter_outlives_its_network() {
    let network = Network::new(NetworkConfig::default());
    let source = Source::new(&network, 0);
    let _observer = source.state.observe(|_| {});
    let emitter = source.emitter.lock().unwrap().clone().unwrap();

    network.shutdown().unwrap();
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    drop(source);
    drop(network);
    assert!(matches!(emitter.emit(1), Err(Error::ShutDown)));
}

#[test]
fn changes_and_hold_round_trip_a_cell() {
    let network = Network::new(NetworkConfig::default());
    let input = network.state_input(1);
    let mirrored = input.state().changes().hold(0);

    let (seen, record) = recorder();
    let _observer = mirrored.observe(record);

    input.set(4).unwrap();
    input.set(4).unwrap();
    input.set(9).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![0, 4, 9]);
}

// Errors

#[test]
fn sampling_inside_a_derivation_is_rejected() {
    let network = Network::new(NetworkConfig::default());
    let input = network.state_input(1);
    let other = network.state_input(2);

    let peek = other.state().clone();
    let rejected = input
        .state()
        .map(move |_| matches!(peek.sample(), Err(Error::SampleDuringPropagation(_))));
    let _observer = rejected.observe(|_| {});
    assert!(rejected.sample().unwrap());
}

#[test]
fn failed_transaction_leaves_unrelated_state_alone() {
    let network = Network::new(NetworkConfig::default());
    let input = network.state_input(1);
    let unrelated = network.state_input(5);
    let checked = input.state().try_map(|v| if *v > 0 { Ok(*v) } else { Err("must be positive") });
    let total = checked.combine(unrelated.state(), |a, b| a + b);
    let _observer = total.observe(|_| {});

    let err = network
        .run_transaction(vec![input.write(0), unrelated.write(50)])
        .unwrap_err();
    assert!(matches!(err, Error::Derivation { node, ref message } if node == checked.id() && message == "must be positive"));
    assert_eq!(total.sample().unwrap(), 6);

    unrelated.set(7).unwrap();
    assert_eq!(total.sample().unwrap(), 8);
}

#[test]
fn failed_activation_leaves_later_transactions_working() {
    let network = Network::new(NetworkConfig::default());
    let input = network.state_input(0);
    let unrelated = network.state_input(1);
    let checked = input.state().try_map(|v| if *v > 0 { Ok(*v) } else { Err("must be positive") });

    let err = checked.try_observe(|_| {}).unwrap_err();
    assert!(matches!(err, Error::Derivation { node, .. } if node == checked.id()));
    assert_eq!(checked.activation_state(), Some(ActivationState::Inactive));

    let (seen, record) = recorder();
    let _observer = unrelated.state().map(|v| v * 2).observe(record);
    unrelated.set(3).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![2, 6]);

    // observe logs the failure and hands back a cancelled handle.
    assert!(checked.observe(|_| {}).is_cancelled());

    input.set(4).unwrap();
    let (values, record) = recorder();
    let _observer = checked.try_observe(record).unwrap();
    assert_eq!(*values.lock().unwrap(), vec![4]);
}

#[test]
fn long_chains_activate_and_release() {
    let network = Network::new(NetworkConfig::default());
    let input = network.state_input(0_u64);
    let mut tail = input.state().clone();
    for _ in 0..20_000 {
        tail = tail.map(|v| v + 1);
    }

    let (seen, record) = recorder();
    let observer = tail.observe(record);
    input.set(1).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![20_000, 20_001]);

    observer.cancel().unwrap();
    assert_eq!(tail.activation_state(), Some(ActivationState::Inactive));
}

#[test]
fn source_start_panic_is_reported() {
    let network = Network::new(NetworkConfig::manual());
    let broken = network.external_events::<i32, _>(|_| panic!("device unavailable"));
    let _observer = broken.observe(|_| {});

    let err = network.run_until_quiescent().unwrap_err();
    assert!(matches!(err, Error::SourceFailed { node, message } if node == broken.id() && message == "device unavailable"));
}

#[test]
fn writes_after_shutdown_fail() {
    let network = Network::new(NetworkConfig::default());
    let input = network.state_input(0);

    network.shutdown().unwrap();
    assert!(network.is_shut_down());
    assert!(matches!(input.set(1), Err(Error::ShutDown)));
    assert!(matches!(network.enqueue(Vec::new()), Err(Error::ShutDown)));
}

#[test]
fn manual_mode_waits_for_the_drain() {
    let network = Network::new(NetworkConfig::default().with_drain_mode(DrainMode::Manual));
    let input = network.state_input(0);

    network.enqueue(vec![input.write(1)]).unwrap();
    network.enqueue(vec![input.write(2)]).unwrap();
    assert_eq!(network.pending_transactions(), 2);
    assert_eq!(input.sample().unwrap(), 0);

    network.run_until_quiescent().unwrap();
    assert_eq!(network.pending_transactions(), 0);
    assert_eq!(input.sample().unwrap(), 2);
}

// Async driver

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_driver_drains_and_shuts_down() {
    let (stop, lifetime) = tokio::sync::oneshot::channel::<()>();
    let config = NetworkConfig::default().with_drain_mode(DrainMode::Background);
    let network = Network::launch(config, async move {
        let _ = lifetime.await;
    })
    .unwrap();

    let input = network.state_input(1);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _observer = input.state().map(|v| v * 3).observe(move |v| {
        let _ = tx.send(*v);
    });

    assert_eq!(rx.recv().await, Some(3));
    input.set(2).unwrap();
    assert_eq!(rx.recv().await, Some(6));

    stop.send(()).unwrap();
    network.closed().await;
    assert!(network.is_shut_down());
    assert!(matches!(input.set(3), Err(Error::ShutDown)));
}

#[tokio::test]
async fn activate_until_holds_the_scope_open() {
    let network = Network::new(NetworkConfig::default());
    let source = Source::new(&network, 0);
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

    let state = source.state.clone();
    let run = network.activate_until(
        move |_| state.observe(|_| {}),
        async move {
            let _ = stopped.await;
        },
    );
    let starts = source.starts.clone();
    let stops = source.stops.clone();
    let check = async move {
        tokio::task::yield_now().await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        stop.send(()).unwrap();
    };

    let (observer, ()) = tokio::join!(run, check);
    assert!(observer.unwrap().is_cancelled());
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);
}
