// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end reactor scenarios: the blended dispatch loop, timers
//! racing I/O, deferred work fairness and the async-safe trigger fired
//! from a real POSIX signal handler.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use evio::{
    IoEvents, Reactor, IoReadyService, TimerConnection, TimerService, WorkTrigger,
    WorkqueueService,
};

fn raw_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    // Safety: `fds` is a live two-element array.
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    assert_eq!(res, 0, "pipe2 failed");
    (fds[0], fds[1])
}

fn close(fd: RawFd) {
    // Safety: callers only pass fds they own.
    unsafe { libc::close(fd) };
}

fn write_bytes(fd: RawFd, bytes: &[u8]) {
    // Safety: the buffer is live for the call.
    let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
    assert_eq!(n, bytes.len() as isize);
}

fn read_some(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buffer = [0u8; 256];
    loop {
        // Safety: the buffer is live for the call.
        let n = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buffer[..n as usize]);
    }
    out
}

/// Opt-in diagnostics: `RUST_LOG=evio=trace cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Echo with idle timeout: data written to one pipe is copied to a
/// second one; every read re-arms an idle timer, which fires exactly
/// once after the input goes quiet.
#[test]
fn echo_with_idle_timeout() {
    const IDLE: Duration = Duration::from_millis(300);

    init_tracing();
    let reactor = Arc::new(Reactor::new().unwrap());
    let (in_read, in_write) = raw_pipe();
    let (out_read, out_write) = raw_pipe();

    let idle_fired = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let idle_conn = {
        let idle_fired = idle_fired.clone();
        let done = done.clone();
        let r = reactor.clone();
        reactor.timer(
            move |_now| {
                idle_fired.fetch_add(1, Ordering::SeqCst);
                done.store(true, Ordering::SeqCst);
                r.wake_up();
            },
            Instant::now() + IDLE,
        )
    };

    let mut echo_conn = {
        let idle_conn = idle_conn.clone();
        reactor.watch(
            move |_events| {
                let data = read_some(in_read);
                write_bytes(out_write, &data);
                idle_conn.set(Instant::now() + IDLE);
            },
            in_read,
            IoEvents::INPUT,
        )
    };

    let writer = std::thread::spawn(move || {
        write_bytes(in_write, b"ab");
        std::thread::sleep(Duration::from_millis(100));
        write_bytes(in_write, b"c");
        in_write
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while !done.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "idle timer never fired");
        reactor.dispatch();
    }

    assert_eq!(read_some(out_read), b"abc");
    assert_eq!(idle_fired.load(Ordering::SeqCst), 1);

    let in_write = writer.join().unwrap();
    echo_conn.disconnect();
    let mut idle_conn = idle_conn;
    idle_conn.disconnect();
    drop(reactor);
    for fd in [in_read, in_write, out_read, out_write] {
        close(fd);
    }
}

/// A queued procedure from another thread interrupts a blocking
/// dispatch.
#[test]
fn queued_procedure_wakes_blocked_dispatch() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let r = reactor.clone();
    let d = done.clone();
    let producer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let d = d.clone();
        r.queue_procedure(move || {
            d.store(true, Ordering::SeqCst);
        });
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while !done.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "queued procedure never ran");
        reactor.dispatch();
    }

    producer.join().unwrap();
}

/// A self-re-arming deferred procedure must not starve queued one-shot
/// work: one dispatch step runs all triggered procedures but at most one
/// ad-hoc item.
#[test]
fn workqueue_fairness_in_dispatch_steps() {
    let reactor = Reactor::new().unwrap();
    let trace: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::default();

    let trigger_slot: Arc<parking_lot::Mutex<Option<WorkTrigger>>> = Arc::default();
    let (_conn, trigger) = {
        let trace = trace.clone();
        let trigger_slot = trigger_slot.clone();
        reactor.register_async_deferred_procedure(move || {
            trace.lock().push("p");
            if let Some(trigger) = trigger_slot.lock().as_ref() {
                trigger.trigger();
            }
        })
    };
    *trigger_slot.lock() = Some(trigger.clone());

    for name in ["q1", "q2", "q3"] {
        let trace = trace.clone();
        reactor.queue_procedure(move || trace.lock().push(name));
    }
    trigger.trigger();

    for _ in 0..4 {
        reactor.dispatch_pending();
    }

    let trace = trace.lock();
    let p_runs = trace.iter().filter(|s| **s == "p").count();
    let one_shots: Vec<_> = trace.iter().filter(|s| **s != "p").collect();
    assert_eq!(p_runs, 4, "one run of the re-arming procedure per step");
    assert_eq!(one_shots, vec![&"q1", &"q2", &"q3"]);
}

#[test]
fn dispatch_pending_all_drains_everything() {
    let reactor = Reactor::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let ran = ran.clone();
        reactor.queue_procedure(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    // a timer that is already due
    let r = ran.clone();
    let _conn = reactor.timer(
        move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        },
        Instant::now(),
    );

    reactor.dispatch_pending_all();
    assert_eq!(ran.load(Ordering::SeqCst), 6);
    assert!(!reactor.dispatch_pending());
}

#[test]
fn due_timers_run_before_blocking() {
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    let _conn = reactor.one_shot_timer(
        move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        },
        Instant::now() + Duration::from_millis(50),
    );

    // the first dispatch blocks until the timer is due, the loop exits
    // right after it fired
    let deadline = Instant::now() + Duration::from_secs(10);
    while fired.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "timer never fired");
        reactor.dispatch();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// === async-safe trigger from a real signal handler ===

static SIGNAL_TRIGGER: OnceLock<WorkTrigger> = OnceLock::new();

extern "C" fn on_alarm(_signum: libc::c_int) {
    // async-signal-safe path: an atomic swap, a lock-free push and a
    // write(2) on the wakeup pipe
    if let Some(trigger) = SIGNAL_TRIGGER.get() {
        trigger.trigger();
    }
}

/// The async-safe trigger, fired from a `SIGALRM` handler driven by a
/// POSIX interval timer, results in the registered procedure running on
/// the dispatching thread, at most once per dispatch iteration.
#[test]
fn async_trigger_from_signal_handler() {
    const INTERVAL: Duration = Duration::from_millis(50);
    const WINDOW: Duration = Duration::from_millis(350);

    let reactor = Arc::new(Reactor::new().unwrap());
    let runs = Arc::new(AtomicUsize::new(0));

    let r = runs.clone();
    let (_conn, trigger) = reactor.register_async_deferred_procedure(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    SIGNAL_TRIGGER.set(trigger).ok();

    // install the handler
    // Safety: all-zero sigaction is valid as a starting point.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_alarm as usize;
    action.sa_flags = libc::SA_RESTART;
    // Safety: `action` is fully initialized; inspecting the old action
    // is not needed.
    let res = unsafe { libc::sigaction(libc::SIGALRM, &action, std::ptr::null_mut()) };
    assert_eq!(res, 0);

    // arm a periodic interval timer
    let interval = libc::timeval {
        tv_sec: 0,
        tv_usec: INTERVAL.as_micros() as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    // Safety: `timer` is fully initialized.
    let res = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    assert_eq!(res, 0);

    // a backstop timer bounds the last blocking dispatch
    let r = reactor.clone();
    let _stop = reactor.one_shot_timer(move |_| r.wake_up(), Instant::now() + WINDOW);

    let end = Instant::now() + WINDOW;
    let mut iterations = 0usize;
    while Instant::now() < end {
        reactor.dispatch();
        iterations += 1;
    }

    // disarm the interval timer again
    let disarm = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
    };
    // Safety: `disarm` is fully initialized.
    unsafe { libc::setitimer(libc::ITIMER_REAL, &disarm, std::ptr::null_mut()) };

    let runs = runs.load(Ordering::SeqCst);
    assert!(runs >= 1, "no signal-triggered run observed");
    assert!(
        runs <= iterations,
        "at most one run per dispatch iteration (runs {runs}, iterations {iterations})"
    );
}

/// Timers and I/O interleave on one loop: input arriving before the
/// timer postpones nothing, and the timer still fires on schedule.
#[test]
fn io_and_timers_share_the_loop() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let (read_fd, write_fd) = raw_pipe();

    let io_hits = Arc::new(AtomicUsize::new(0));
    let timer_hits = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let h = io_hits.clone();
    let _io = reactor.watch(
        move |_| {
            read_some(read_fd);
            h.fetch_add(1, Ordering::SeqCst);
        },
        read_fd,
        IoEvents::INPUT,
    );

    let t = timer_hits.clone();
    let d = done.clone();
    let r = reactor.clone();
    let _timer: TimerConnection = reactor.one_shot_timer(
        move |_| {
            t.fetch_add(1, Ordering::SeqCst);
            d.store(true, Ordering::SeqCst);
            r.wake_up();
        },
        Instant::now() + Duration::from_millis(150),
    );

    write_bytes(write_fd, b"early");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !done.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timer never fired");
        reactor.dispatch();
    }

    assert_eq!(io_hits.load(Ordering::SeqCst), 1);
    assert_eq!(timer_hits.load(Ordering::SeqCst), 1);

    drop(reactor);
    close(read_fd);
    close(write_fd);
}
