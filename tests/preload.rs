//! End to end. This test binary links `memtrack`, so its own `malloc()` and
//! `free()` go through the exported entry points. Each check re-runs the
//! binary as a child doing one workload and reads what it wrote to stderr.

use std::{
    collections::HashMap,
    env,
    process::{Command, Output},
    sync::Barrier,
};

use memtrack::{
    config::{MAX_THREADS, PREFIX, TRACE_ON_ALLOC, TRACE_ON_RELEASE},
    diag::stack::{EMPTY_TRACE, TRACE_FOOTER},
};

/// Names the workload a child process should run
const CHILD: &str = "MEMTRACK_TEST_CHILD";

const WORKERS: usize = 4;
const ROUNDS: usize = 10;
const STEP: usize = 4_000_000;

fn run_child(workload: &str) -> Output {
    Command::new(env::current_exe().unwrap())
        .args([workload, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD, workload)
        .output()
        .unwrap()
}

fn is_child(workload: &str) -> bool {
    env::var(CHILD).is_ok_and(|w| w == workload)
}

#[derive(Debug)]
struct Event<'a> {
    tag: &'a str,
    used: &'a str,
    op: &'a str,
    address: &'a str,
    delta: &'a str,
}

/// `<prefix>[thread i/T] (used= <human>): <op> @ <address> | <delta>`
fn parse_event(line: &str) -> Option<Event<'_>> {
    let rest = line.strip_prefix(PREFIX)?.strip_prefix('[')?;
    let (tag, rest) = rest.split_once("] (used=")?;
    let (used, body) = rest.split_once("): ")?;
    let (op, rest) = body.split_once(" @ ")?;
    let (address, delta) = rest.split_once(" | ")?;
    Some(Event {
        tag,
        used: used.trim(),
        op: op.trim(),
        address,
        delta,
    })
}

fn check_tag(tag: &str) {
    let (index, total) = tag
        .strip_prefix("thread ")
        .and_then(|t| t.split_once('/'))
        .unwrap_or_else(|| panic!("bad thread tag: {tag}"));
    let index: usize = index.parse().unwrap();
    assert_eq!(total.parse::<usize>().unwrap(), MAX_THREADS);
    assert!((1..=MAX_THREADS).contains(&index), "{tag}");
}

/// Every event line well-formed, every trace block whole and right after
/// its event. Returns the events in order.
fn events(stderr: &str) -> Vec<Event<'_>> {
    let event_start = format!("{PREFIX}[");
    let mut events = Vec::new();
    let mut lines = stderr.lines();
    while let Some(line) = lines.next() {
        if !line.starts_with(&event_start) {
            continue;
        }
        let event = parse_event(line).unwrap_or_else(|| panic!("malformed line: {line}"));
        check_tag(event.tag);
        assert!(matches!(event.op, "malloc" | "free"), "{line}");
        assert!(
            (event.delta.starts_with('+') || event.delta.starts_with('-'))
                && event.delta.ends_with('B'),
            "{line}"
        );

        let traced = match event.op {
            "malloc" => TRACE_ON_ALLOC && event.address != "0x0",
            _ => TRACE_ON_RELEASE,
        };
        if traced {
            let header = format!("==== {PREFIX} BACKTRACE ({})", event.tag);
            assert_eq!(lines.next(), Some(header.as_str()), "after {line}");
            loop {
                let frame = lines.next().expect("unterminated trace");
                if frame == TRACE_FOOTER {
                    break;
                }
                assert!(
                    frame.starts_with('#') || frame == EMPTY_TRACE,
                    "interleaved into a trace: {frame}"
                );
            }
        }
        events.push(event);
    }
    events
}

#[test]
fn threads_are_accounted_and_logged() {
    let output = run_child("workload_threads");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "{stderr}");

    let mut by_thread: HashMap<&str, Vec<&Event<'_>>> = HashMap::new();
    let events = events(&stderr);
    for event in &events {
        by_thread.entry(event.tag).or_default().push(event);
    }

    let sizes: Vec<String> = (1..=ROUNDS).map(|i| format!("+{}B", STEP * i)).collect();
    let mut pairs = 0;
    for seq in by_thread.values() {
        for (k, event) in seq.iter().enumerate() {
            if event.op != "malloc" || !sizes.iter().any(|s| s == event.delta) {
                continue;
            }
            let free = seq.get(k + 1).expect("workload malloc without its free");
            assert_eq!(free.op, "free");
            assert_eq!(free.address, event.address);
            // freeing the block puts the thread back where it was
            if let Some(before) = k.checked_sub(1).map(|j| seq[j]) {
                assert_eq!(free.used, before.used, "{event:?} then {free:?}");
            }
            pairs += 1;
        }
    }
    assert_eq!(pairs, WORKERS * ROUNDS);
}

#[test]
fn workload_threads() {
    if !is_child("workload_threads") {
        return;
    }
    crossbeam::scope(|s| {
        for _ in 0..WORKERS {
            s.spawn(|_| {
                for i in 1..=ROUNDS {
                    unsafe {
                        let buf = libc::malloc(STEP * i);
                        assert!(!buf.is_null());
                        libc::free(buf);
                    }
                }
            });
        }
    })
    .unwrap();
}

#[test]
fn too_many_threads_is_fatal() {
    if MAX_THREADS <= 1 {
        // every thread is thread 0, there is no bound to exceed
        return;
    }
    let output = run_child("workload_too_many_threads");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(libc::EXIT_FAILURE), "{stderr}");
    let expected = format!("{PREFIX} error: memtrack built with insufficient thread support");
    assert!(stderr.contains(&expected), "{stderr}");
}

#[test]
fn workload_too_many_threads() {
    if !is_child("workload_too_many_threads") {
        return;
    }
    let threads = MAX_THREADS + 1;
    let all_started = Barrier::new(threads);
    let all_allocated = Barrier::new(threads);
    crossbeam::scope(|s| {
        for _ in 0..threads {
            s.spawn(|_| {
                all_started.wait();
                unsafe { libc::free(libc::malloc(64)) };
                // nobody exits (and gives a slot back) before everybody has one
                all_allocated.wait();
            });
        }
    })
    .unwrap();
}
