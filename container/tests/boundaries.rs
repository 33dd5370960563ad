//! Boundary behaviors, lifecycle properties and failure policies

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weir_common::{Datum, Offset, Partition, SystemStreamPartition};
use weir_container::Container;

use common::*;

const BASE: &[(&str, &str)] = &[
    ("job.name", "job"),
    ("task.inputs", "mem.s"),
    ("systems.mem.factory", "memory"),
    ("systems.mem.key.serde", "string"),
    ("systems.mem.msg.serde", "string"),
    ("streams.mem.s.offset.default", "earliest"),
    ("task.poll.interval.ms", "5"),
];

fn cfg(extra: &[(&str, &str)]) -> Arc<config::Config> {
    let mut pairs = BASE.to_vec();
    pairs.extend_from_slice(extra);
    config(&pairs)
}

fn input_ssp(partition: u32) -> SystemStreamPartition {
    SystemStreamPartition::new("mem", "s", Partition(partition))
}

#[tokio::test]
async fn disabled_windowing_never_calls_window() {
    let mut harness = Harness::new();
    let journal = journal();
    let windows = Arc::new(AtomicU64::new(0));
    harness.registry.register_task_factory(
        "tick",
        Arc::new(TickTaskFactory { journal: journal.clone(), windows: windows.clone() }),
    );

    let config = cfg(&[("task.class", "tick"), ("task.window.ms", "-1")]);
    let container =
        Container::build("container-0", &[Partition(0)], config, &harness.registry).unwrap();

    let shutdown = container.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.store(true, Ordering::Relaxed);
    });
    container.run().await.unwrap();

    assert_eq!(windows.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn idle_input_still_ticks_windows_and_commits() {
    let mut harness = Harness::new();
    let journal = journal();
    let windows = Arc::new(AtomicU64::new(0));
    harness.registry.register_task_factory(
        "tick",
        Arc::new(TickTaskFactory { journal: journal.clone(), windows: windows.clone() }),
    );

    let config = cfg(&[
        ("task.class", "tick"),
        ("task.window.ms", "0"),
        ("task.commit.ms", "0"),
        ("task.checkpoint.factory", "memory"),
        ("test.shutdown.after.windows", "3"),
    ]);
    let container =
        Container::build("container-0", &[Partition(0)], config, &harness.registry).unwrap();
    container.run().await.unwrap();

    assert_eq!(windows.load(Ordering::Relaxed), 3);
    assert!(journal.lock().unwrap().is_empty());

    // Commits ran on every idle iteration; with nothing processed the
    // checkpoints are empty but still written.
    let checkpoints = harness.checkpoints_for("job-0");
    assert_eq!(checkpoints.len(), 3);
    assert!(checkpoints.iter().all(|checkpoint| checkpoint.is_empty()));
}

#[tokio::test]
async fn latest_offset_default_skips_preexisting_messages() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(None, Some("old-1")), (None, Some("old-2"))]);
    let journal = journal();
    let windows = Arc::new(AtomicU64::new(0));
    harness.registry.register_task_factory(
        "tick",
        Arc::new(TickTaskFactory { journal: journal.clone(), windows: windows.clone() }),
    );

    let config = cfg(&[
        ("task.class", "tick"),
        ("task.window.ms", "0"),
        ("test.shutdown.after.windows", "5"),
        ("streams.mem.s.offset.default", "latest"),
    ]);
    let container =
        Container::build("container-0", &[Partition(0)], config, &harness.registry).unwrap();
    container.run().await.unwrap();

    assert!(journal.lock().unwrap().is_empty());
}

#[tokio::test]
async fn without_checkpoint_manager_offsets_follow_the_reset_policy() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(None, Some("a")), (None, Some("b")), (None, Some("c"))]);
    let journal = journal();
    harness
        .registry
        .register_task_factory("echo", Arc::new(EchoTaskFactory { journal: journal.clone() }));

    // No task.checkpoint.factory configured at all.
    let config = cfg(&[("task.class", "echo"), ("test.shutdown.after", "3")]);
    let container =
        Container::build("container-0", &[Partition(0)], config, &harness.registry).unwrap();
    container.run().await.unwrap();

    let offsets: Vec<String> = journal
        .lock()
        .unwrap()
        .iter()
        .map(|entry| entry.offset.as_str().to_string())
        .collect();
    assert_eq!(offsets, vec!["0", "1", "2"]);
    assert!(harness.history.lock().unwrap().is_empty());
}

#[tokio::test]
async fn file_checkpoints_resume_and_reset_offset_ignores_them() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(None, Some("a")), (None, Some("b")), (None, Some("c"))]);
    let state_dir = tempfile::tempdir().unwrap();
    let state = state_dir.path().to_str().unwrap().to_string();

    // First run processes offsets 0..=2 and checkpoints them on disk.
    let journal_one = journal();
    harness
        .registry
        .register_task_factory("echo", Arc::new(EchoTaskFactory { journal: journal_one.clone() }));
    let config = cfg(&[
        ("task.class", "echo"),
        ("test.shutdown.after", "3"),
        ("task.checkpoint.factory", "file"),
        ("job.state.dir", &state),
    ]);
    Container::build("container-0", &[Partition(0)], config.clone(), &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(journal_one.lock().unwrap().len(), 3);

    // Three more messages arrive while the container is down.
    for value in ["d", "e", "f"] {
        harness.broker.publish("mem", "s", Partition(0), None, Some(value.as_bytes().to_vec()));
    }

    // A restart resumes after the checkpointed offset.
    let journal_two = journal();
    harness
        .registry
        .register_task_factory("echo", Arc::new(EchoTaskFactory { journal: journal_two.clone() }));
    Container::build("container-0", &[Partition(0)], config, &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap();
    let resumed: Vec<String> = journal_two
        .lock()
        .unwrap()
        .iter()
        .map(|entry| entry.offset.as_str().to_string())
        .collect();
    assert_eq!(resumed, vec!["3", "4", "5"]);

    // With reset.offset the checkpoint is ignored on every start and the
    // stream replays from its default policy.
    let journal_three = journal();
    harness.registry.register_task_factory(
        "echo",
        Arc::new(EchoTaskFactory { journal: journal_three.clone() }),
    );
    let reset_config = cfg(&[
        ("task.class", "echo"),
        ("test.shutdown.after", "6"),
        ("task.checkpoint.factory", "file"),
        ("job.state.dir", &state),
        ("streams.mem.s.reset.offset", "true"),
    ]);
    Container::build("container-0", &[Partition(0)], reset_config, &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(journal_three.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn restore_runs_fresh_on_every_start_and_never_amplifies() {
    let mut harness = Harness::new();
    harness.seed("mem", "kvlog", 0, 0, &[(Some("k"), Some("v1")), (Some("k"), Some("v2"))]);
    let store_pairs: &[(&str, &str)] = &[
        ("task.class", "probe"),
        ("task.window.ms", "0"),
        ("stores.kv.factory", "memory"),
        ("stores.kv.changelog", "mem.kvlog"),
        ("stores.kv.key.serde", "string"),
        ("stores.kv.msg.serde", "string"),
    ];

    for _ in 0..2 {
        let probe = probe_cell();
        harness
            .registry
            .register_task_factory("probe", Arc::new(ProbeTaskFactory { probe: probe.clone() }));
        Container::build("container-0", &[Partition(0)], cfg(store_pairs), &harness.registry)
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(*probe.lock().unwrap(), Some(Some(Datum::text("v2"))));
    }
    assert_eq!(harness.broker.len("mem", "kvlog", Partition(0)), 2);
}

#[tokio::test]
async fn every_started_consumer_and_producer_is_stopped_once() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(Some("k"), Some("v"))]);
    let counting = CountingSystemFactory::new(harness.broker.clone());
    let counts = counting.counts.clone();
    harness.registry.register_system_factory("memory", Arc::new(counting));
    let journal = journal();
    harness
        .registry
        .register_task_factory("store", Arc::new(StoreTaskFactory { journal: journal.clone() }));

    let config = cfg(&[
        ("task.class", "store"),
        ("test.shutdown.after", "1"),
        ("stores.kv.factory", "memory"),
        ("stores.kv.changelog", "mem.kvlog"),
        ("stores.kv.key.serde", "string"),
        ("stores.kv.msg.serde", "string"),
    ]);
    Container::build("container-0", &[Partition(0)], config, &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap();

    // The shared multiplexer consumer plus the dedicated restore consumer.
    assert_eq!(counts.consumer_starts.load(Ordering::Relaxed), 2);
    assert_eq!(counts.producer_starts.load(Ordering::Relaxed), 1);
    assert!(counts.balanced());
}

#[tokio::test]
async fn task_failure_is_fatal_but_shutdown_still_runs_everywhere() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(None, Some("fine")), (None, Some("boom"))]);
    let counting = CountingSystemFactory::new(harness.broker.clone());
    let counts = counting.counts.clone();
    harness.registry.register_system_factory("memory", Arc::new(counting));
    let journal = journal();
    let events = event_log();
    harness
        .registry
        .register_task_factory("failing", Arc::new(FailingTaskFactory { journal: journal.clone() }));
    harness
        .registry
        .register_listener_factory("recording", Arc::new(RecordingListenerFactory { events: events.clone() }));

    let config = cfg(&[
        ("task.class", "failing"),
        ("task.lifecycle.listeners", "spy"),
        ("task.lifecycle.listener.spy.class", "recording"),
    ]);
    let error = Container::build("container-0", &[Partition(0)], config, &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(error.to_string().contains("job-0"));

    assert_eq!(journal.lock().unwrap().len(), 1);
    assert!(counts.balanced());
    assert!(events.lock().unwrap().contains(&"failure:job-0@1".to_string()));
}

#[tokio::test]
async fn decode_failure_is_fatal_by_default() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(None, Some("1")), (None, Some("x"))]);
    let journal = journal();
    harness
        .registry
        .register_task_factory("echo", Arc::new(EchoTaskFactory { journal: journal.clone() }));

    let config = cfg(&[
        ("task.class", "echo"),
        ("streams.mem.s.msg.serde", "integer"),
    ]);
    let error = Container::build("container-0", &[Partition(0)], config, &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(format!("{error:#}").contains("decoding envelope"));
    assert_eq!(journal.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn commit_failures_are_logged_not_fatal() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(None, Some("a")), (None, Some("b")), (None, Some("c"))]);
    let journal = journal();
    harness
        .registry
        .register_task_factory("echo", Arc::new(EchoTaskFactory { journal: journal.clone() }));
    harness.registry.register_checkpoint_factory("failing", Arc::new(FailingCheckpointFactory));

    let config = cfg(&[
        ("task.class", "echo"),
        ("test.shutdown.after", "3"),
        ("task.commit.ms", "0"),
        ("task.checkpoint.factory", "failing"),
    ]);
    Container::build("container-0", &[Partition(0)], config, &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(journal.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn lifecycle_listeners_observe_the_whole_task_life() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(None, Some("a")), (None, Some("b"))]);
    let journal = journal();
    let events = event_log();
    harness
        .registry
        .register_task_factory("echo", Arc::new(EchoTaskFactory { journal: journal.clone() }));
    harness
        .registry
        .register_listener_factory("recording", Arc::new(RecordingListenerFactory { events: events.clone() }));

    let config = cfg(&[
        ("task.class", "echo"),
        ("test.shutdown.after", "2"),
        ("task.lifecycle.listeners", "spy"),
        ("task.lifecycle.listener.spy.class", "recording"),
    ]);
    Container::build("container-0", &[Partition(0)], config, &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "before_init:job-0".to_string(),
            "after_init:job-0".to_string(),
            "before_process:job-0@0".to_string(),
            "after_process:job-0@0".to_string(),
            "before_process:job-0@1".to_string(),
            "after_process:job-0@1".to_string(),
            "before_close:job-0".to_string(),
        ]
    );
}

#[test]
fn setup_failures_refuse_the_container() {
    let harness = Harness::new();

    // Empty partition set.
    let error = Container::build("c", &[], cfg(&[("task.class", "echo")]), &harness.registry)
        .unwrap_err();
    assert!(error.to_string().contains("no partitions"));

    // Missing required task.class.
    let error =
        Container::build("c", &[Partition(0)], cfg(&[]), &harness.registry).unwrap_err();
    assert!(error.to_string().contains("task.class"));

    // Unknown task factory name.
    let error =
        Container::build("c", &[Partition(0)], cfg(&[("task.class", "ghost")]), &harness.registry)
            .unwrap_err();
    assert!(error.to_string().contains("ghost"));

    // Referenced system without a factory entry.
    let error = Container::build(
        "c",
        &[Partition(0)],
        config(&[("task.class", "echo"), ("task.inputs", "elsewhere.s")]),
        &harness.registry,
    )
    .unwrap_err();
    assert!(error.to_string().contains("systems.elsewhere.factory"));
}

#[tokio::test]
async fn commit_request_from_the_task_forces_an_early_checkpoint() {
    let mut harness = Harness::new();
    harness.seed("mem", "s", 0, 0, &[(None, Some("a"))]);
    let journal = journal();
    harness
        .registry
        .register_task_factory("echo", Arc::new(EchoTaskFactory { journal: journal.clone() }));

    // Interval far in the future: only the coordinator request commits.
    let config = cfg(&[
        ("task.class", "echo"),
        ("test.shutdown.after", "1"),
        ("task.commit.ms", "3600000"),
        ("task.checkpoint.factory", "memory"),
    ]);
    Container::build("container-0", &[Partition(0)], config, &harness.registry)
        .unwrap()
        .run()
        .await
        .unwrap();

    let checkpoint = harness.last_checkpoint("job-0").unwrap();
    assert_eq!(checkpoint.get(&input_ssp(0)), Some(&Offset::new("0")));
}
