//! End-to-end runs of the deferred path on a real event loop.

use handoff_core::config::HandoffConfig;
use handoff_core::error::{HandoffError, ReadError, WriteError};
use handoff_core::handle::{HandleValue, RequestHandle};
use handoff_core::host::{HandlerStatus, Response, StaticResponse};
use handoff_core::mux::{Interest, Multiplexer, Readiness, Registrar, Token, Trigger};
use handoff_core::sink::{ChannelHealth, HandleSink};
use handoff_core::worker::{TaskSpawner, WorkerTask};
use handoff_core::RequestHost;
use handoff_executor::{init_process, ResumeHandler, ResumeReport};
use handoff_module::{channel, EventLoop, FixedPool, RequestTable, ThreadPerTask};

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

type Table = Rc<RefCell<RequestTable<()>>>;

fn table() -> Table {
    Rc::new(RefCell::new(RequestTable::with_log(64)))
}

fn hello() -> StaticResponse {
    StaticResponse(Response::text(200, "hello\n"))
}

/// Run the loop until `done` or five seconds pass.
fn pump<M: Multiplexer>(mux: &mut M, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        mux.run_once(Some(Duration::from_millis(20))).unwrap();
    }
    true
}

fn wait_idle<S: TaskSpawner>(spawner: &S) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while spawner.outstanding() > 0 {
        assert!(Instant::now() < deadline, "workers did not finish");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn sleeping_worker_is_resumed_once() {
    init_test_logging();
    let mut ev = EventLoop::new(64, 64).unwrap();
    let host = table();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_cb = Rc::clone(&seen);
    let responder = move |h: &RequestHandle| {
        seen_cb.borrow_mut().push(h.value());
        Response::text(200, "hello\n")
    };
    let ctx = init_process(
        &mut ev,
        Rc::clone(&host),
        responder,
        ThreadPerTask::new(0),
        &HandoffConfig::default(),
    )
    .unwrap();

    let h1 = host.borrow_mut().admit(());
    let v1 = h1.value();
    let start = Instant::now();
    let status = ctx
        .defer(&mut Rc::clone(&host), h1, || thread::sleep(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(status, HandlerStatus::Deferred);
    assert!(host.borrow().is_deferred(v1));

    assert!(pump(&mut ev, || host.borrow().pending() == 0));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(5));

    // A few more idle turns must not resume it again.
    for _ in 0..3 {
        ev.run_once(Some(Duration::from_millis(5))).unwrap();
    }
    assert_eq!(*seen.borrow(), vec![v1]);

    let done = host.borrow_mut().take_finalized();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].handle, v1);
    assert_eq!(done[0].response.status, 200);
    assert_eq!(done[0].response.body, b"hello\n");

    assert_eq!(ctx.exit_process(), 0);
}

#[test]
fn back_to_back_handles_drain_in_one_wakeup() {
    init_test_logging();
    let mut ev = EventLoop::new(64, 64).unwrap();
    let host = table();
    // One worker, FIFO queue: H1 is written before H2.
    let pool = FixedPool::new(1, 8).unwrap();
    let ctx = init_process(&mut ev, Rc::clone(&host), hello(), pool, &HandoffConfig::default())
        .unwrap();

    let mut hostref = Rc::clone(&host);
    let h1 = host.borrow_mut().admit(());
    let h2 = host.borrow_mut().admit(());
    let (v1, v2) = (h1.value(), h2.value());
    ctx.defer(&mut hostref, h1, || {}).unwrap();
    ctx.defer(&mut hostref, h2, || {}).unwrap();

    wait_idle(ctx.spawner());
    assert_eq!(ev.run_once(Some(Duration::from_secs(1))).unwrap(), 1);

    let order: Vec<_> = host
        .borrow_mut()
        .take_finalized()
        .into_iter()
        .map(|f| f.handle)
        .collect();
    assert_eq!(order, vec![v1, v2]);
    assert_eq!(ctx.exit_process(), 0);
}

#[test]
fn duplicate_delivery_finalizes_once() {
    init_test_logging();
    let mut ev = EventLoop::new(64, 64).unwrap();
    let host = table();
    let (write_end, read_end) = channel(Duration::from_millis(200)).unwrap();
    let fd = read_end.as_raw_fd();
    let mut handler = ResumeHandler::new(read_end, Rc::clone(&host), hello(), ChannelHealth::new());
    let totals = Rc::new(RefCell::new(ResumeReport::default()));
    let totals_cb = Rc::clone(&totals);
    ev.register(
        fd,
        Interest::READABLE,
        Trigger::Edge,
        Box::new(move |_: &mut dyn Registrar, _: Token, _: Readiness| {
            let report = match handler.on_readable() {
                Ok(report) => report,
                Err(e) => e.report,
            };
            *totals_cb.borrow_mut() += report;
        }),
    )
    .unwrap();

    let h = host.borrow_mut().admit(());
    host.borrow_mut().suspend(&h).unwrap();
    let value = h.into_raw();

    // The reactor side keeps a reference so the pipe stays open after
    // the worker exits.
    let sink = Arc::new(write_end);
    let worker_sink = Arc::clone(&sink);
    let writer = thread::spawn(move || {
        worker_sink.write_value(value).unwrap();
        worker_sink.write_value(value).unwrap();
    });
    writer.join().unwrap();

    assert!(pump(&mut ev, || totals.borrow().delivered() == 2));
    assert_eq!(*totals.borrow(), ResumeReport { finalized: 1, discarded: 1, failed: 0 });
    assert_eq!(host.borrow_mut().take_finalized().len(), 1);
    drop(sink);
}

#[test]
fn pass_ending_on_closed_writer_still_reports_its_deliveries() {
    init_test_logging();
    let host = table();
    let (write_end, read_end) = channel(Duration::from_millis(200)).unwrap();
    let mut handler = ResumeHandler::new(read_end, Rc::clone(&host), hello(), ChannelHealth::new());

    let h = host.borrow_mut().admit(());
    host.borrow_mut().suspend(&h).unwrap();
    let v = h.value();
    write_end.write_handle(h).unwrap();
    drop(write_end);

    let err = handler.on_readable().unwrap_err();
    assert_eq!(err.error, ReadError::Closed);
    assert_eq!(err.report.finalized, 1);
    assert!(handler.health().is_degraded());
    assert_eq!(host.borrow_mut().take_finalized()[0].handle, v);
}

#[test]
fn transport_closure_degrades_without_touching_finished_requests() {
    init_test_logging();
    let mut ev = EventLoop::new(64, 64).unwrap();
    let host = table();
    let ctx = init_process(
        &mut ev,
        Rc::clone(&host),
        hello(),
        ThreadPerTask::new(0),
        &HandoffConfig::default(),
    )
    .unwrap();
    let mut hostref = Rc::clone(&host);

    let h1 = host.borrow_mut().admit(());
    let v1 = h1.value();
    ctx.defer(&mut hostref, h1, || {}).unwrap();
    assert!(pump(&mut ev, || host.borrow().pending() == 0));

    // Drop the read end: every later write hits a closed pipe.
    ev.deregister(ctx.token()).unwrap();

    let h2 = host.borrow_mut().admit(());
    let v2 = h2.value();
    ctx.defer(&mut hostref, h2, || {}).unwrap();
    wait_idle(ctx.spawner());
    assert!(!ctx.is_available());

    // H2 is orphaned: still suspended, never finalized, visible as overdue.
    assert!(host.borrow().is_deferred(v2));
    assert_eq!(host.borrow().overdue(Duration::ZERO).len(), 1);

    // New deferrals are refused with the handle returned.
    let h3 = host.borrow_mut().admit(());
    let v3 = h3.value();
    let rejected = ctx.defer(&mut hostref, h3, || {}).unwrap_err();
    assert!(matches!(rejected.error, HandoffError::Unavailable));
    assert_eq!(rejected.handle.value(), v3);

    let done = host.borrow_mut().take_finalized();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].handle, v1);
    assert_eq!(done[0].response.status, 200);
    assert_eq!(ctx.exit_process(), 0);
}

#[test]
fn worker_write_to_closed_channel_reports_transport_error() {
    init_test_logging();
    let (write_end, read_end) = channel(Duration::from_millis(100)).unwrap();
    drop(read_end);

    let sink = Arc::new(write_end);
    let err = sink
        .write_handle(RequestHandle::from_raw(HandleValue::new(1, 0)))
        .unwrap_err();
    assert_eq!(err, WriteError::Closed);

    let health = ChannelHealth::new();
    WorkerTask::new(
        RequestHandle::from_raw(HandleValue::new(2, 0)),
        Box::new(|| {}),
        sink,
        health.clone(),
    )
    .run();
    assert!(health.is_degraded());
}

#[test]
fn every_trigger_mode_delivers() {
    init_test_logging();
    for trigger in [Trigger::Edge, Trigger::Level, Trigger::OneShot] {
        let mut ev = EventLoop::new(64, 64).unwrap();
        let host = table();
        let config = HandoffConfig::default().trigger(trigger);
        let ctx = init_process(&mut ev, Rc::clone(&host), hello(), ThreadPerTask::new(0), &config)
            .unwrap();
        let mut hostref = Rc::clone(&host);

        for round in 0..3 {
            for _ in 0..4 {
                let h = host.borrow_mut().admit(());
                ctx.defer(&mut hostref, h, move || thread::sleep(Duration::from_millis(round)))
                    .unwrap();
            }
            assert!(
                pump(&mut ev, || host.borrow().pending() == 0),
                "{:?} stalled in round {}",
                trigger,
                round
            );
        }
        assert_eq!(host.borrow_mut().take_finalized().len(), 12);
        assert_eq!(ctx.exit_process(), 0);
    }
}

#[test]
fn fixed_pool_delivers_every_request() {
    init_test_logging();
    let mut ev = EventLoop::new(64, 64).unwrap();
    let host = table();
    let ctx = init_process(
        &mut ev,
        Rc::clone(&host),
        hello(),
        FixedPool::new(2, 16).unwrap(),
        &HandoffConfig::default(),
    )
    .unwrap();
    let mut hostref = Rc::clone(&host);

    for _ in 0..10 {
        let h = host.borrow_mut().admit(());
        ctx.defer(&mut hostref, h, || thread::sleep(Duration::from_millis(1)))
            .unwrap();
    }
    assert!(pump(&mut ev, || host.borrow().pending() == 0));
    assert_eq!(host.borrow_mut().take_finalized().len(), 10);
    assert_eq!(ctx.exit_process(), 0);
}
