mod common;

use common::init_tracing;
use kqport::{Error, EventFlags, Filter, Interest, LabQueue, Ops, RawEvent, Selector};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

fn lab_selector() -> (Arc<LabQueue>, Selector<Arc<LabQueue>>) {
    init_tracing();

    let lab = Arc::new(LabQueue::new());
    let selector = Selector::new(lab.clone()).unwrap();

    (lab, selector)
}

#[test]
fn test_ready_key_is_selected() {
    let (lab, selector) = lab_selector();
    let fd = lab.virtual_fd(7);

    let key = selector.register(fd, Ops::READ).unwrap();
    assert_eq!(selector.select_now().unwrap(), 0);
    assert!(lab.is_registered(fd, Filter::Read));

    lab.set_ready(fd, Filter::Read);
    assert_eq!(selector.select(Some(Duration::from_secs(1))).unwrap(), 1);

    assert!(key.is_readable());
    assert!(!key.is_writable());

    let selected = selector.selected_keys();
    assert_eq!(selected.len(), 1);
    assert!(Arc::ptr_eq(&selected[0], &key));
}

#[test]
fn test_both_filters_count_once() {
    let (lab, selector) = lab_selector();
    let fd = lab.virtual_fd(8);

    let key = selector.register(fd, Ops::READ | Ops::WRITE).unwrap();
    selector.select_now().unwrap();

    lab.set_ready(fd, Filter::Read);
    lab.set_ready(fd, Filter::Write);

    assert_eq!(selector.select_now().unwrap(), 1);
    assert_eq!(key.ready_ops(), Ops::READ | Ops::WRITE);
}

#[test]
fn test_selected_key_counts_only_new_readiness() {
    let (lab, selector) = lab_selector();
    let fd = lab.virtual_fd(9);

    let key = selector.register(fd, Ops::READ | Ops::WRITE).unwrap();
    lab.set_ready(fd, Filter::Read);

    assert_eq!(selector.select_now().unwrap(), 1);

    // Still readable and still selected: nothing new to report.
    assert_eq!(selector.select_now().unwrap(), 0);

    lab.set_ready(fd, Filter::Write);
    assert_eq!(selector.select_now().unwrap(), 1);
    assert_eq!(key.ready_ops(), Ops::READ | Ops::WRITE);

    selector.clear_selected();
    lab.clear_ready(fd, Filter::Write);

    assert_eq!(selector.select_now().unwrap(), 1);
    assert_eq!(key.ready_ops(), Ops::READ);
}

#[test]
fn test_interrupted_select_keeps_deadline() {
    let (lab, selector) = lab_selector();

    lab.interrupt_next_poll(Duration::from_millis(150));

    let start = Instant::now();
    assert_eq!(selector.select(Some(Duration::from_millis(200))).unwrap(), 0);

    assert!(start.elapsed() >= Duration::from_millis(190));
    assert!(start.elapsed() < Duration::from_millis(300));
    assert_eq!(selector.stats().polls, 2);
}

#[test]
fn test_interrupt_past_deadline_returns_zero() {
    let (lab, selector) = lab_selector();

    lab.interrupt_next_poll(Duration::from_millis(250));

    assert_eq!(selector.select(Some(Duration::from_millis(200))).unwrap(), 0);
    assert_eq!(selector.stats().polls, 1);
    assert_eq!(lab.poll_count(), 1);
}

#[test]
fn test_wakeup_unblocks_select_from_another_thread() {
    let (_lab, selector) = lab_selector();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            selector.wakeup().unwrap();
        });

        assert_eq!(selector.select(None).unwrap(), 0);
    });

    let stats = selector.stats();
    assert_eq!(stats.wakeup_bytes_written, 1);
    assert_eq!(stats.wakeup_bytes_drained, 1);
}

#[test]
fn test_interest_change_applied_as_diff() {
    let (lab, selector) = lab_selector();
    let fd = lab.virtual_fd(10);

    let key = selector.register(fd, Ops::ACCEPT).unwrap();
    selector.select_now().unwrap();
    assert_eq!(key.registered_interest(), Interest::READ);

    selector.set_interest(&key, Ops::CONNECT).unwrap();

    // Queued until the next select.
    assert!(lab.is_registered(fd, Filter::Read));
    assert!(!lab.is_registered(fd, Filter::Write));

    selector.select_now().unwrap();
    assert!(!lab.is_registered(fd, Filter::Read));
    assert!(lab.is_registered(fd, Filter::Write));
    assert_eq!(key.registered_interest(), Interest::WRITE);

    lab.set_ready(fd, Filter::Write);
    assert_eq!(selector.select_now().unwrap(), 1);
    assert!(key.is_connectable());
    assert!(!key.is_writable());
}

#[test]
fn test_cancel_applied_at_next_select() {
    let (lab, selector) = lab_selector();
    let fd = lab.virtual_fd(11);

    let key = selector.register(fd, Ops::READ).unwrap();
    selector.select_now().unwrap();

    key.cancel();
    key.cancel();
    assert!(!key.is_valid());
    assert!(matches!(key.set_interest(Ops::WRITE), Err(Error::CancelledKey)));
    assert!(lab.is_registered(fd, Filter::Read));

    lab.set_ready(fd, Filter::Read);
    assert_eq!(selector.select_now().unwrap(), 0);

    assert!(!lab.is_registered(fd, Filter::Read));
    assert!(selector.keys().is_empty());
    assert!(selector.selected_keys().is_empty());
}

#[test]
fn test_deregister_is_idempotent() {
    let (lab, selector) = lab_selector();
    let fd = lab.virtual_fd(12);

    let key = selector.register(fd, Ops::READ | Ops::WRITE).unwrap();
    selector.select_now().unwrap();

    selector.deregister(&key);
    assert!(!lab.is_registered(fd, Filter::Read));
    assert!(!lab.is_registered(fd, Filter::Write));

    let before = lab.registrations();
    selector.deregister(&key);
    assert_eq!(lab.registrations(), before);

    // The descriptor can be registered again under a new key.
    let again = selector.register(fd, Ops::READ).unwrap();
    assert!(!Arc::ptr_eq(&again, &key));
    selector.select_now().unwrap();
    assert!(lab.is_registered(fd, Filter::Read));
}

#[test]
fn test_select_with_bypasses_selected_set() {
    let (lab, selector) = lab_selector();
    let a = lab.virtual_fd(20);
    let b = lab.virtual_fd(21);

    selector.register(a, Ops::READ).unwrap();
    selector.register(b, Ops::WRITE).unwrap();
    lab.set_ready(a, Filter::Read);
    lab.set_ready(b, Filter::Write);

    let mut seen = Vec::new();
    let count = selector
        .select_with(|key| seen.push((key.fd(), key.ready_ops())), Some(Duration::ZERO))
        .unwrap();

    seen.sort_by_key(|(fd, _)| *fd);

    assert_eq!(count, 2);
    assert_eq!(seen, vec![(a, Ops::READ), (b, Ops::WRITE)]);
    assert!(selector.selected_keys().is_empty());
}

#[test]
fn test_error_record_reports_all_interest() {
    let (lab, selector) = lab_selector();
    let fd = lab.virtual_fd(30);

    let key = selector.register(fd, Ops::READ | Ops::WRITE).unwrap();
    selector.select_now().unwrap();

    lab.inject(RawEvent::new(fd as u64, Filter::Write, EventFlags::ERROR));

    assert_eq!(selector.select_now().unwrap(), 1);
    assert_eq!(key.ready_ops(), Ops::READ | Ops::WRITE);
}

#[test]
fn test_close_deregisters_everything() {
    let (lab, selector) = lab_selector();
    let fd = lab.virtual_fd(40);

    let key = selector.register(fd, Ops::READ).unwrap();
    selector.select_now().unwrap();

    selector.close();

    assert!(!selector.is_open());
    assert!(!key.is_valid());
    assert!(lab.is_closed());
    assert!(matches!(selector.select(None), Err(Error::ClosedSelector)));
}

/// Runs `f` on a helper thread and fails the test if it does not finish.
fn within<T: Send + 'static>(timeout: Duration, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let _ = tx.send(f());
    });

    rx.recv_timeout(timeout).expect("selector operation hung")
}

#[test]
fn test_action_can_deregister_its_key() {
    let (lab, selector) = lab_selector();
    let selector = Arc::new(selector);
    let fd = lab.virtual_fd(50);

    let key = selector.register(fd, Ops::READ).unwrap();
    lab.set_ready(fd, Filter::Read);

    let inner = selector.clone();
    let count = within(Duration::from_secs(3), move || {
        inner
            .select_with(
                |key| {
                    inner.deregister(key);
                    inner.clear_selected();
                    assert!(inner.selected_keys().is_empty());
                },
                Some(Duration::ZERO),
            )
            .unwrap()
    });

    assert_eq!(count, 1);
    assert!(!key.is_valid());
    assert!(!lab.is_registered(fd, Filter::Read));
    assert!(selector.keys().is_empty());
}

#[test]
fn test_action_can_close_selector() {
    let (lab, selector) = lab_selector();
    let selector = Arc::new(selector);
    let fd = lab.virtual_fd(51);

    selector.register(fd, Ops::WRITE).unwrap();
    lab.set_ready(fd, Filter::Write);

    let inner = selector.clone();
    let count = within(Duration::from_secs(3), move || {
        inner
            .select_with(|_| inner.close(), Some(Duration::ZERO))
            .unwrap()
    });

    assert_eq!(count, 1);
    assert!(!selector.is_open());
    assert!(lab.is_closed());
}

#[test]
fn test_wakeup_after_close_writes_nothing() {
    let (_lab, selector) = lab_selector();

    thread::scope(|s| {
        let blocked = s.spawn(|| selector.select(None));

        thread::sleep(Duration::from_millis(50));
        selector.close();

        // Either woken by close, or too late to start.
        let _ = blocked.join().unwrap();
    });

    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    assert_eq!(unsafe { libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK) }, 0);

    assert!(matches!(selector.wakeup(), Err(Error::ClosedSelector)));
    assert!(matches!(selector.wakeup(), Err(Error::ClosedSelector)));

    let mut byte = [0u8; 1];
    let n = unsafe { libc::read(fds[0], byte.as_mut_ptr().cast(), 1) };
    assert_eq!(n, -1);
    assert_eq!(selector.stats().wakeup_bytes_written, 1);

    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}
