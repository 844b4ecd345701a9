//! handoff HTTP/1.1 demo server
//!
//! Single-threaded reactor. Every `GET` is parked on a worker thread that
//! sleeps for `--delay-ms`, then resumed on the reactor and answered with
//! a plain-text hello. `GET /now` is answered inline, without a worker.
//!
//! Usage:
//!     ./target/release/handoff-httpd [--port 8080] [--delay-ms 10] [--workers N]
//!
//! Without `--workers` the spawner comes from `HANDOFF_SPAWNER`
//! (thread-per-task by default). `RUST_LOG` controls log output.
//!
//! Benchmark:
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

mod http;
mod server;

use handoff_core::config::{HandoffConfig, SpawnerKind};
use handoff_core::error::HandoffError;
use handoff_core::handle::RequestHandle;
use handoff_core::host::Response;
use handoff_core::mux::{Interest, Multiplexer, Registrar, Trigger};
use handoff_executor::init_process;
use handoff_module::{spawner_from_config, EventLoop};

use server::{accept_callback, HttpHost, HELLO_BODY};

use std::cell::RefCell;
use std::env;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

static RUNNING: AtomicBool = AtomicBool::new(true);

const MAX_CONNS: usize = 4096;
const TICK: Duration = Duration::from_millis(100);
const STATS_EVERY: Duration = Duration::from_secs(5);
/// Deferred requests older than this are reported in the stats line.
const OVERDUE_AFTER: Duration = Duration::from_secs(30);

struct Args {
    port: u16,
    delay: Duration,
    workers: Option<usize>,
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();
    let mut out = Args {
        port: 8080,
        delay: Duration::from_millis(10),
        workers: None,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1).map(String::as_str);
        match (flag, value) {
            ("--port" | "-p", Some(v)) => match v.parse() {
                Ok(port) => out.port = port,
                Err(_) => tracing::warn!(value = v, "bad --port, keeping {}", out.port),
            },
            ("--delay-ms" | "-d", Some(v)) => match v.parse() {
                Ok(ms) => out.delay = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = v, "bad --delay-ms, keeping {:?}", out.delay),
            },
            ("--workers" | "-w", Some(v)) => match v.parse() {
                Ok(n) => out.workers = Some(n),
                Err(_) => tracing::warn!(value = v, "bad --workers, ignoring"),
            },
            _ => {
                tracing::warn!(arg = flag, "unknown or incomplete argument");
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    out
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let args = parse_args();
    if let Err(e) = run(args) {
        tracing::error!(error = %e, "handoff-httpd failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> handoff_core::Result<()> {
    let mut config = HandoffConfig::from_env();
    if let Some(n) = args.workers {
        config = config.spawner(SpawnerKind::FixedPool).pool_workers(n);
    }
    config.validate()?;

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut ev = EventLoop::from_config(&config).map_err(|e| HandoffError::os(&e))?;
    let host = Rc::new(RefCell::new(HttpHost::new(MAX_CONNS)));
    let spawner = spawner_from_config(&config)?;
    let responder = |_: &RequestHandle| Response::text(200, HELLO_BODY);
    let ctx = Rc::new(init_process(&mut ev, Rc::clone(&host), responder, spawner, &config)?);

    let listener = TcpListener::bind(("0.0.0.0", args.port)).map_err(|e| HandoffError::os(&e))?;
    listener.set_nonblocking(true).map_err(|e| HandoffError::os(&e))?;
    let listen_fd = listener.as_raw_fd();
    ev.register(
        listen_fd,
        Interest::READABLE,
        Trigger::Level,
        accept_callback(listener, Rc::clone(&host), Rc::clone(&ctx), args.delay),
    )?;

    tracing::info!(
        port = args.port,
        delay = ?args.delay,
        spawner = ?config.spawner,
        trigger = ?config.trigger,
        "listening"
    );

    let mut last_stats = Instant::now();
    while RUNNING.load(Ordering::Relaxed) {
        ev.run_once(Some(TICK)).map_err(|e| HandoffError::os(&e))?;
        // Responses finalized by the resume path may have left work that
        // needs the registrar.
        host.borrow_mut().service_queues(&mut ev, &ctx, args.delay);

        if last_stats.elapsed() >= STATS_EVERY {
            host.borrow().log_stats(OVERDUE_AFTER);
            if !ctx.is_available() {
                tracing::error!("deferred completion unavailable, answering inline");
            }
            last_stats = Instant::now();
        }
    }

    tracing::info!("shutting down");
    // Drain while the read end is still registered so the last workers'
    // handles are resumed instead of hitting a closed pipe.
    let remaining = ctx.drain();
    ev.run_once(Some(Duration::ZERO)).map_err(|e| HandoffError::os(&e))?;
    host.borrow_mut().service_queues(&mut ev, &ctx, args.delay);
    if remaining > 0 {
        tracing::warn!(remaining, "workers still running after drain");
    }
    // Callbacks hold the other references to the context.
    drop(ev);
    let ctx = Rc::try_unwrap(ctx)
        .map_err(|_| HandoffError::Config("defer context still shared at shutdown"))?;
    let orphaned = ctx.exit_process();
    host.borrow().log_stats(OVERDUE_AFTER);
    tracing::info!(orphaned, "shutdown complete");
    Ok(())
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
