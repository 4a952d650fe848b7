mod common;

use common::{RecordingChannel, init_tracing, wait_until};
use kqport::{
    Channel, Error, EventFlags, Filter, Interest, LabQueue, PortBuilder, PortHandle, RawEvent,
    Ready,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn lab_port(threads: usize) -> (Arc<LabQueue>, kqport::Port<Arc<LabQueue>>) {
    init_tracing();

    let lab = Arc::new(LabQueue::new());
    let port = PortBuilder::new()
        .worker_threads(threads)
        .poll_capacity(16)
        .build(lab.clone())
        .unwrap();

    (lab, port)
}

#[test]
fn test_oneshot_read_end_to_end() {
    let (lab, port) = lab_port(2);
    let fd = lab.virtual_fd(7);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(fd, channel.clone()).unwrap();
    port.register_channel(fd, Interest::READ).unwrap();
    assert_eq!(port.registered_interest(fd), Ready::READ);

    lab.set_ready(fd, Filter::Read);

    assert!(wait_until(WAIT, || channel.count() == 1));
    assert_eq!(channel.calls.lock().unwrap()[0].0, Ready::READ);
    assert_eq!(port.registered_interest(fd), Ready::empty());
    assert!(!lab.is_registered(fd, Filter::Read));
}

#[test]
fn test_interrupted_poll_is_retried() {
    init_tracing();

    let lab = Arc::new(LabQueue::new());
    for _ in 0..3 {
        lab.interrupt_next_poll(Duration::from_millis(1));
    }

    let port = PortBuilder::new()
        .worker_threads(2)
        .build(lab.clone())
        .unwrap();

    let fd = lab.virtual_fd(60);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(fd, channel.clone()).unwrap();
    port.register_channel(fd, Interest::READ).unwrap();
    lab.set_ready(fd, Filter::Read);

    assert!(wait_until(WAIT, || channel.count() == 1));
    assert!(lab.poll_count() >= 4);
    assert_eq!(port.thread_count(), 2);
    assert!(!port.is_shutdown());
}

#[test]
fn test_at_most_once_per_registration() {
    let (lab, port) = lab_port(4);
    let fd = lab.virtual_fd(8);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(fd, channel.clone()).unwrap();
    port.register_channel(fd, Interest::READ).unwrap();
    lab.set_ready(fd, Filter::Read);

    assert!(wait_until(WAIT, || channel.count() == 1));

    // The kernel reports the descriptor again before anyone re-registered.
    lab.inject(RawEvent::new(fd as u64, Filter::Read, EventFlags::empty()));
    lab.inject(RawEvent::new(fd as u64, Filter::Read, EventFlags::empty()));

    assert!(wait_until(WAIT, || lab.poll_count() >= 3));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(channel.count(), 1);

    port.register_channel(fd, Interest::READ).unwrap();
    assert!(wait_until(WAIT, || channel.count() == 2));
}

#[test]
fn test_read_and_write_interest() {
    let (lab, port) = lab_port(2);
    let fd = lab.virtual_fd(9);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(fd, channel.clone()).unwrap();
    port.register_channel(fd, Interest::READ | Interest::WRITE)
        .unwrap();
    assert!(lab.is_registered(fd, Filter::Read));
    assert!(lab.is_registered(fd, Filter::Write));

    lab.set_ready(fd, Filter::Write);
    lab.set_ready(fd, Filter::Read);

    assert!(wait_until(WAIT, || channel.union() == Ready::READ | Ready::WRITE));
    assert!(channel.count() <= 2);
    assert_eq!(port.registered_interest(fd), Ready::empty());
}

/// Re-arms itself until it has seen `limit` events.
struct Rearming {
    fd: i32,
    port: PortHandle<Arc<LabQueue>>,
    seen: AtomicUsize,
    limit: usize,
}

impl Channel for Rearming {
    fn on_event(&self, _ready: Ready, _on_pool_thread: bool) {
        if self.seen.fetch_add(1, Ordering::AcqRel) + 1 < self.limit {
            self.port.register_channel(self.fd, Interest::READ).unwrap();
        }
    }
}

#[test]
fn test_single_poller_under_load() {
    let (lab, port) = lab_port(8);
    let mut channels = Vec::new();

    for fd in 100..116 {
        let fd = lab.virtual_fd(fd);
        let channel = Arc::new(Rearming {
            fd,
            port: port.handle(),
            seen: AtomicUsize::new(0),
            limit: 20,
        });

        port.attach(fd, channel.clone()).unwrap();
        port.register_channel(fd, Interest::READ).unwrap();
        lab.set_ready(fd, Filter::Read);
        channels.push(channel);
    }

    let tasks = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let tasks = tasks.clone();
        port.submit(move || {
            tasks.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }

    assert!(wait_until(WAIT, || {
        channels.iter().all(|c| c.seen.load(Ordering::Acquire) == 20)
            && tasks.load(Ordering::Acquire) == 50
    }));

    assert_eq!(lab.max_concurrent_polls(), 1);
    port.shutdown_now();
}

#[test]
fn test_tasks_run_on_port_threads() {
    let (_lab, port) = lab_port(3);
    let names = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..20 {
        let names = names.clone();
        port.submit(move || {
            let name = thread::current().name().map(str::to_owned);
            names.lock().unwrap().push(name);
        })
        .unwrap();
    }

    assert!(wait_until(WAIT, || names.lock().unwrap().len() == 20));
    assert!(
        names
            .lock()
            .unwrap()
            .iter()
            .all(|n| n.as_deref().is_some_and(|n| n.starts_with("kqport-worker-")))
    );
}

#[test]
fn test_shutdown_signals_each_thread_and_releases_once() {
    let (lab, port) = lab_port(4);
    assert_eq!(port.thread_count(), 4);

    port.shutdown();
    assert!(port.await_termination(WAIT));

    let stats = port.stats();
    assert_eq!(stats.wakeups, 4);
    assert_eq!(stats.bytes_drained, stats.bytes_written);
    assert_eq!(stats.releases, 1);
    assert_eq!(port.thread_count(), 0);
    assert!(port.is_terminated());
    assert!(lab.is_closed());

    port.shutdown();
    assert_eq!(port.stats().wakeups, 4);
    assert_eq!(port.stats().releases, 1);
}

#[test]
fn test_shutdown_without_threads_releases_immediately() {
    let (lab, port) = lab_port(0);

    port.shutdown();

    assert!(port.is_terminated());
    assert!(lab.is_closed());
    assert_eq!(port.stats().wakeups, 0);
    assert_eq!(port.stats().releases, 1);
}

#[test]
fn test_closed_port_rejects_work() {
    let (lab, port) = lab_port(2);
    let fd = lab.virtual_fd(12);

    port.shutdown();
    assert!(port.await_termination(WAIT));

    assert!(matches!(port.submit(|| {}), Err(Error::RejectedExecution)));
    assert!(matches!(
        port.register_channel(fd, Interest::READ),
        Err(Error::RejectedExecution)
    ));
    assert!(matches!(
        port.attach(fd, Arc::new(RecordingChannel::default())),
        Err(Error::RejectedExecution)
    ));
}

#[test]
fn test_registration_failure_is_internal_error() {
    let (lab, port) = lab_port(1);
    let fd = lab.virtual_fd(13);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(fd, channel).unwrap();
    lab.fail_next_register(libc::ENOMEM);

    match port.register_channel(fd, Interest::READ | Interest::WRITE) {
        Err(Error::Internal { fd: failed, filter, .. }) => {
            assert_eq!(failed, fd);
            assert_eq!(filter, Filter::Read);
        }
        other => panic!("expected internal error, got {other:?}"),
    }

    assert_eq!(port.registered_interest(fd), Ready::empty());
    assert!(!lab.is_registered(fd, Filter::Write));
}

#[test]
fn test_panicking_task_replaces_worker() {
    let (_lab, port) = lab_port(2);

    port.submit(|| panic!("task failure")).unwrap();
    assert!(wait_until(WAIT, || port.stats().replacements == 1));
    assert_eq!(port.thread_count(), 2);

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let done = done.clone();
        port.submit(move || {
            done.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }

    assert!(wait_until(WAIT, || done.load(Ordering::Acquire) == 10));

    port.shutdown();
    assert!(port.await_termination(WAIT));
}

struct Exploding;

impl Channel for Exploding {
    fn on_event(&self, _ready: Ready, _on_pool_thread: bool) {
        panic!("callback failure");
    }
}

#[test]
fn test_panicking_callback_keeps_port_alive() {
    let (lab, port) = lab_port(2);
    let bad = lab.virtual_fd(20);
    let good = lab.virtual_fd(21);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(bad, Arc::new(Exploding)).unwrap();
    port.attach(good, channel.clone()).unwrap();

    port.register_channel(bad, Interest::READ).unwrap();
    lab.set_ready(bad, Filter::Read);
    assert!(wait_until(WAIT, || port.stats().replacements == 1));

    port.register_channel(good, Interest::WRITE).unwrap();
    lab.set_ready(good, Filter::Write);
    assert!(wait_until(WAIT, || channel.count() == 1));
    assert_eq!(port.thread_count(), 2);
}

#[test]
fn test_pool_thread_flag() {
    init_tracing();

    let lab = Arc::new(LabQueue::new());
    let port = PortBuilder::new()
        .worker_threads(0)
        .internal_threads(1)
        .build(lab.clone())
        .unwrap();

    let fd = lab.virtual_fd(30);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(fd, channel.clone()).unwrap();
    port.register_channel(fd, Interest::READ).unwrap();
    lab.set_ready(fd, Filter::Read);

    assert!(wait_until(WAIT, || channel.count() == 1));
    assert!(!channel.calls.lock().unwrap()[0].1);
}

#[test]
fn test_events_for_detached_channel_are_dropped() {
    let (lab, port) = lab_port(2);
    let fd = lab.virtual_fd(40);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(fd, channel.clone()).unwrap();
    port.register_channel(fd, Interest::READ).unwrap();
    assert!(port.detach(fd).is_some());
    assert!(port.detach(fd).is_none());

    lab.set_ready(fd, Filter::Read);
    assert!(wait_until(WAIT, || !lab.is_registered(fd, Filter::Read)));
    thread::sleep(Duration::from_millis(20));

    assert_eq!(channel.count(), 0);
}

#[test]
fn test_shutdown_now_closes_channels() {
    let (lab, port) = lab_port(2);
    let fd = lab.virtual_fd(50);
    let channel = Arc::new(RecordingChannel::default());

    port.attach(fd, channel.clone()).unwrap();
    port.shutdown_now();

    assert!(channel.is_closed());
    assert!(port.detach(fd).is_none());
    assert!(port.is_shutdown());
    assert!(port.await_termination(WAIT));
}
