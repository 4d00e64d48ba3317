//! End-to-end tests for ForkPool.
//!
//! Every test forks real processes. They run serially so timing checks are
//! not skewed by other tests' workers.

use forkpool::{
    Config, ExitStatus, FailureCause, ForkPool, Invocable, LogSink, Receiver, Role,
    TASK_FAILURE_CODE, TASK_PANIC_CODE,
};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serial_test::serial;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// `[millis, value]`: sleep, then return `value`.
fn sleep_then_echo(args: &[Value]) -> anyhow::Result<Value> {
    let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
    std::thread::sleep(Duration::from_millis(ms));
    Ok(args.get(1).cloned().unwrap_or(Value::Null))
}

fn echo(args: &[Value]) -> anyhow::Result<Value> {
    Ok(Value::Array(args.to_vec()))
}

fn fail(_: &[Value]) -> anyhow::Result<Value> {
    anyhow::bail!("task refused to work")
}

fn explode(_: &[Value]) -> anyhow::Result<Value> {
    panic!("task exploded")
}

fn exit_early(_: &[Value]) -> anyhow::Result<Value> {
    // `print!` is intercepted by the test harness; fd 1 is what gets captured.
    let mut out = std::io::stdout();
    write!(out, "before exit")?;
    out.flush()?;
    std::process::exit(3)
}

/// Exit with the code given as the first argument.
fn exit_with(args: &[Value]) -> anyhow::Result<Value> {
    let code = args.first().and_then(Value::as_i64).unwrap_or(1);
    std::process::exit(i32::try_from(code)?)
}

fn kill_self(_: &[Value]) -> anyhow::Result<Value> {
    nix::sys::signal::kill(nix::unistd::getpid(), Signal::SIGKILL)?;
    Ok(Value::Null)
}

fn chatty(args: &[Value]) -> anyhow::Result<Value> {
    let mut out = std::io::stdout();
    writeln!(out, "hello from worker")?;
    writeln!(out, "args: {}", Value::Array(args.to_vec()))?;
    Ok(json!(42))
}

#[derive(Serialize, Deserialize)]
struct Counter {
    start: i64,
}

impl Receiver for Counter {
    fn call(&self, selector: &str, args: &[Value]) -> anyhow::Result<Value> {
        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
        match selector {
            "add" => Ok(json!(self.start + n)),
            "sub" => Ok(json!(self.start - n)),
            other => anyhow::bail!("unknown method {}", other),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<(Role, String)>>,
}

impl LogSink for RecordingSink {
    fn info(&self, role: Role, _pid: Pid, message: &str) {
        self.lines.lock().unwrap().push((role, message.to_string()));
    }

    fn error(&self, role: Role, _pid: Pid, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((role, format!("ERROR {}", message)));
    }
}

#[test]
#[serial]
fn test_results_follow_enqueue_order() {
    let mut pool = ForkPool::with_concurrency(4).unwrap();

    // Later tasks finish first.
    for (i, ms) in [300, 200, 100, 0].into_iter().enumerate() {
        pool.fork(
            Invocable::function(sleep_then_echo),
            json!([ms, format!("bar{}", i + 1)]),
            None,
        )
        .unwrap();
    }

    let results = pool.get(None).unwrap();
    assert_eq!(
        results.values(),
        vec![json!("bar1"), json!("bar2"), json!("bar3"), json!("bar4")]
    );
    assert!(results.iter().all(|r| r.is_success()));
    assert!(!pool.has_error());
}

#[test]
#[serial]
fn test_get_by_tag() {
    let mut pool = ForkPool::with_concurrency(3).unwrap();

    pool.fork(Invocable::function(sleep_then_echo), json!([100, "a1"]), Some("a"))
        .unwrap();
    pool.fork(Invocable::function(sleep_then_echo), json!([0, "b1"]), Some("b"))
        .unwrap();
    pool.fork(Invocable::function(sleep_then_echo), json!([0, "a2"]), Some("a"))
        .unwrap();
    pool.fork(Invocable::function(sleep_then_echo), json!([0, "none"]), None)
        .unwrap();

    let a = pool.get(Some("a")).unwrap();
    assert_eq!(a.values(), vec![json!("a1"), json!("a2")]);
    assert_eq!(pool.get(Some("b")).unwrap().values(), vec![json!("b1")]);
    assert_eq!(pool.get(None).unwrap().len(), 4);
    assert_eq!(pool.get(None).unwrap().tags(), vec!["a", "b"]);

    let err = pool.get(Some("missing")).unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.to_string().contains("missing"));
}

#[test]
#[serial]
fn test_failures_are_reported_without_blocking_siblings() {
    let mut pool = ForkPool::with_concurrency(2).unwrap();

    pool.fork(Invocable::function(echo), "first", None).unwrap();
    pool.fork(Invocable::function(fail), (), Some("fail")).unwrap();
    pool.fork(Invocable::function(explode), (), Some("panic")).unwrap();
    pool.fork(Invocable::function(exit_early), (), Some("exit")).unwrap();
    pool.fork(Invocable::function(kill_self), (), Some("killed")).unwrap();
    pool.fork(Invocable::function(echo), "last", None).unwrap();

    let results = pool.get(None).unwrap();
    assert_eq!(results.len(), 6);

    assert_eq!(results[0].value, json!(["first"]));
    assert_eq!(results[5].value, json!(["last"]));
    assert!(results[0].is_success() && results[5].is_success());

    assert_eq!(results[1].status, ExitStatus::AbnormalExit(TASK_FAILURE_CODE));
    assert_eq!(results[1].error.as_deref(), Some("task refused to work"));

    assert_eq!(results[2].status, ExitStatus::AbnormalExit(TASK_PANIC_CODE));
    assert!(results[2].error.as_deref().unwrap().contains("task exploded"));

    assert_eq!(results[3].status, ExitStatus::AbnormalExit(3));
    assert_eq!(results[3].output, "before exit");

    assert_eq!(results[4].status, ExitStatus::Killed(Signal::SIGKILL as i32));

    assert!(pool.has_error());
    let failure = pool.error().unwrap();
    assert!(failure.pid > 0);
    assert!(matches!(
        failure.cause,
        FailureCause::ExitCode(_) | FailureCause::Signal(_)
    ));
}

#[test]
#[serial]
fn test_concurrency_is_bounded() {
    let mut pool = ForkPool::with_concurrency(2).unwrap();

    let start = Instant::now();
    for i in 0..4 {
        pool.fork(Invocable::function(sleep_then_echo), json!([300, i]), None)
            .unwrap();
    }
    pool.wait().unwrap();
    let elapsed = start.elapsed();

    // Two rounds of two.
    assert!(elapsed >= Duration::from_millis(550), "too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "too slow: {:?}", elapsed);
}

#[test]
#[serial]
fn test_generator_matches_get() {
    let mut pool = ForkPool::with_concurrency(3).unwrap();
    for (ms, v) in [(200, 1), (0, 2), (100, 3)] {
        pool.fork(Invocable::function(sleep_then_echo), json!([ms, v]), None)
            .unwrap();
    }

    let streamed: Vec<Value> = pool.generator().collect();
    assert_eq!(streamed, vec![json!(1), json!(2), json!(3)]);

    // Exhausting the generator joined the pool.
    assert_eq!(pool.get(None).unwrap().values(), streamed);
}

#[test]
#[serial]
fn test_generator_is_not_restartable() {
    let mut pool = ForkPool::with_concurrency(1).unwrap();
    pool.fork(Invocable::function(echo), 1_i64, None).unwrap();

    let mut generator = pool.generator();
    assert_eq!(generator.next(), Some(json!([1])));
    assert_eq!(generator.next(), None);
    assert_eq!(generator.next(), None);
}

#[test]
#[serial]
fn test_wait_is_idempotent() {
    let mut pool = ForkPool::new().unwrap();

    // Nothing forked yet.
    pool.wait().unwrap();
    assert!(pool.get(None).unwrap().is_empty());
    assert_eq!(pool.generator().next(), None);
    assert!(pool.master_pid().is_none());

    pool.fork(Invocable::function(echo), "x", None).unwrap();
    pool.wait().unwrap();
    pool.wait().unwrap();
    assert_eq!(pool.get(None).unwrap().len(), 1);
}

#[test]
#[serial]
#[should_panic(expected = "must wait for its child processes")]
fn test_drop_without_wait_panics() {
    let mut pool = ForkPool::with_concurrency(1).unwrap();
    pool.fork(Invocable::function(sleep_then_echo), json!([50, 1]), None)
        .unwrap();
    drop(pool);
}

#[test]
#[serial]
fn test_drop_after_signal_does_not_panic() {
    let mut pool = ForkPool::with_concurrency(1).unwrap();
    pool.fork(Invocable::function(sleep_then_echo), json!([2000, 1]), None)
        .unwrap();

    pool.set_received_signal(Signal::SIGTERM);
    assert_eq!(pool.received_signal(), Some(Signal::SIGTERM));
    let master = pool.master_pid().unwrap();

    let start = Instant::now();
    drop(pool);
    // The master and its worker were stopped, not waited for.
    assert!(start.elapsed() < Duration::from_millis(1900));
    assert_eq!(
        nix::sys::signal::kill(master, None),
        Err(nix::errno::Errno::ESRCH)
    );
}

#[test]
#[serial]
fn test_stdout_is_captured_separately() {
    let mut pool = ForkPool::with_concurrency(2).unwrap();
    pool.fork(Invocable::function(chatty), json!(["a", 1]), Some("chat"))
        .unwrap();
    pool.fork(Invocable::function(echo), (), None).unwrap();

    let results = pool.get(None).unwrap();
    assert_eq!(results[0].value, json!(42));
    assert_eq!(
        results[0].output,
        "hello from worker\nargs: [\"a\",1]\n"
    );
    assert_eq!(results[1].output, "");
    assert_eq!(results.outputs(), vec![results[0].output(), ""]);
}

#[test]
#[serial]
fn test_methods_closures_and_scalar_args() {
    let mut pool = ForkPool::with_concurrency(3).unwrap();
    let counter = Counter { start: 10 };

    pool.fork(Invocable::method(&counter, "add").unwrap(), 5_i64, None)
        .unwrap();
    pool.fork(Invocable::method(&counter, "sub").unwrap(), json!([3]), None)
        .unwrap();
    pool.fork(
        Invocable::closure(json!({"prefix": "id-"}), |env, args| {
            let prefix = env["prefix"].as_str().unwrap_or("");
            let n = args.first().and_then(Value::as_u64).unwrap_or(0);
            Ok(json!(format!("{}{}", prefix, n)))
        })
        .unwrap(),
        7_u64,
        None,
    )
    .unwrap();
    pool.fork(Invocable::method(&counter, "mul").unwrap(), 2_i64, None)
        .unwrap();
    pool.fork(Invocable::function(echo), "scalar", None).unwrap();

    let results = pool.get(None).unwrap();
    assert_eq!(results[0].value, json!(15));
    assert_eq!(results[1].value, json!(7));
    assert_eq!(results[2].value, json!("id-7"));
    assert_eq!(results[3].status, ExitStatus::AbnormalExit(TASK_FAILURE_CODE));
    assert!(results[3].error.as_deref().unwrap().contains("unknown method mul"));
    assert_eq!(results[4].value, json!(["scalar"]));
}

#[test]
#[serial]
fn test_generations_are_independent() {
    let mut pool = ForkPool::with_concurrency(2).unwrap();

    pool.fork(Invocable::function(fail), (), Some("old")).unwrap();
    pool.fork(Invocable::function(echo), 1_i64, Some("old")).unwrap();
    pool.wait().unwrap();
    assert!(pool.has_error());
    let master = pool.master_pid();

    pool.fork(Invocable::function(echo), 2_i64, Some("new")).unwrap();
    let results = pool.get(None).unwrap();
    assert_eq!(results.values(), vec![json!([2])]);
    assert!(!pool.has_error());
    assert!(pool.error().is_none());
    assert!(pool.get(Some("old")).unwrap_err().is_invalid_argument());

    // The master is reused across generations.
    assert_eq!(pool.master_pid(), master);
}

#[test]
#[serial]
fn test_invalid_configuration() {
    let err = ForkPool::with_concurrency(0).unwrap_err();
    assert!(err.is_invalid_argument());

    let mut config = Config::default();
    config.concurrency = 0;
    assert!(ForkPool::with_config(config).unwrap_err().is_invalid_argument());

    assert!(Config::from_value(&json!({"size": 2})).is_err());
}

#[test]
#[serial]
fn test_owner_log_lines() {
    let sink = Arc::new(RecordingSink::default());
    let config = Config::default()
        .with_concurrency(1)
        .unwrap()
        .with_logger(sink.clone());
    let mut pool = ForkPool::with_config(config).unwrap();
    pool.fork(Invocable::function(echo), (), None).unwrap();
    pool.fork(Invocable::function(echo), (), None).unwrap();
    pool.wait().unwrap();
    drop(pool);

    let lines = sink.lines.lock().unwrap();
    assert!(lines.iter().all(|(role, _)| *role == Role::Owner));
    let text: Vec<&str> = lines.iter().map(|(_, line)| line.as_str()).collect();
    assert!(text[0].starts_with("pool created"));
    assert!(text.iter().any(|l| l.starts_with("forked master process")));
    assert!(text.iter().any(|l| l.starts_with("queued task #1") && l.contains("queue depth 1")));
    assert!(text.iter().any(|l| l.starts_with("queued task #2")));
    assert!(text.iter().any(|l| l.starts_with("shutting down master process")));
}

#[test]
#[serial]
fn test_identity_check() {
    let pool = ForkPool::new().unwrap();
    assert!(pool.is_owner());
    assert_eq!(pool.owner_pid(), nix::unistd::getpid());
    assert_eq!(pool.concurrency(), forkpool::DEFAULT_CONCURRENCY);
}

#[test]
#[serial]
fn test_most_recent_failure_wins() {
    let mut pool = ForkPool::with_concurrency(1).unwrap();
    pool.fork(Invocable::function(exit_with), 3_i64, Some("first"))
        .unwrap();
    pool.fork(Invocable::function(echo), "ok", None).unwrap();
    let last = pool
        .fork(Invocable::function(exit_with), 4_i64, Some("second"))
        .unwrap();
    pool.wait().unwrap();

    let failure = pool.error().unwrap();
    assert_eq!(failure.task_id, last);
    assert_eq!(failure.cause, FailureCause::ExitCode(4));
    assert_eq!(failure.tag.as_deref(), Some("second"));
}

#[test]
#[serial]
fn test_forked_copy_does_not_tear_down() {
    let mut pool = ForkPool::with_concurrency(2).unwrap();
    pool.fork(Invocable::function(echo), 1_i64, None).unwrap();
    let master = pool.master_pid().unwrap();

    // SAFETY: the child only drops its copy of the pool and `_exit`s.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let dropped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let copy = pool;
                if copy.is_owner() {
                    return false;
                }
                drop(copy);
                true
            }));
            let code = if matches!(dropped, Ok(true)) { 0 } else { 1 };
            // SAFETY: leaves the forked test process without running the
            // harness's exit handlers.
            unsafe { nix::libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).unwrap();
            assert!(matches!(status, WaitStatus::Exited(_, 0)), "{:?}", status);

            // The child's drop neither panicked nor stopped the master.
            assert_eq!(nix::sys::signal::kill(master, None), Ok(()));
            pool.fork(Invocable::function(echo), 2_i64, None).unwrap();
            assert_eq!(
                pool.get(None).unwrap().values(),
                vec![json!([1]), json!([2])]
            );
            assert_eq!(pool.master_pid(), Some(master));
        }
    }
}
