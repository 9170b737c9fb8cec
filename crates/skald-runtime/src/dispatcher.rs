//! Request routing.
//!
//! The dispatcher sits between the transport and everything else.
//! Each decoded request passes two staleness gates:
//!
//! - **Gate 1**, on arrival: a request whose enqueue timestamp is
//!   further than `max_diff_time` from now is answered with
//!   `SOCKET_TIMEOUT` and never processed.
//! - **Gate 2**, on dequeue: a work job that sat in the pool longer
//!   than `max_diff_time` is answered with `THREAD_POOL_TIMEOUT`
//!   instead of running.
//!
//! Configuration and introspection commands are served inline on the
//! ingress thread. Work commands (`check_code`, `compile`, `remove`,
//! `run`) are enqueued with the priority the [`PriorityMap`] gives
//! them; a submit rejected by the backlog bound is answered with
//! `THREAD_POOL_EXHAUSTED`. Unknown commands fall through to the work
//! path and come back as `{ERR, "Unsupported command."}`.
//!
//! No panic escapes a worker: the command body runs under
//! `catch_unwind` and an unwind is converted to `{ERR, "unexpected"}`.

use crate::pool::WorkerPool;
use crate::priority::PriorityMap;
use crate::registry::Registry;
use crate::watchdog::Watchdog;
use serde_json::Value as JsonValue;
use skald_engine::ModuleCache;
use skald_proto::{Reply, Request};
use skald_types::{ConvId, NodeId, Status, DEFAULT_MAX_DIFF_TIME_MS};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Where replies go. The transport provides the production
/// implementation; tests collect.
pub trait ReplySink: Send + Sync {
    /// Delivers one reply to the given sender reference.
    fn send(&self, to: &str, reply: Reply);
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Staleness window for both gates.
    pub max_diff_time: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_diff_time: Duration::from_millis(DEFAULT_MAX_DIFF_TIME_MS),
        }
    }
}

/// Routes requests to inline handlers or the worker pool.
pub struct Dispatcher {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    watchdog: Arc<Watchdog>,
    modules: Arc<ModuleCache>,
    priorities: PriorityMap,
    max_diff_time_ms: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Creates a dispatcher over an already-wired runtime.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        watchdog: Arc<Watchdog>,
        modules: Arc<ModuleCache>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            watchdog,
            modules,
            priorities: PriorityMap::default(),
            max_diff_time_ms: Arc::new(AtomicU64::new(config.max_diff_time.as_millis() as u64)),
        }
    }

    /// Handles one request. Control commands reply before this
    /// returns; work commands reply from a worker thread.
    pub fn dispatch(&self, request: Request, sink: &Arc<dyn ReplySink>) {
        let max_diff = self.max_diff_time_ms.load(Ordering::SeqCst);
        if now_ms().abs_diff(request.enqueue_ts) > max_diff {
            tracing::debug!(command = %request.command, "request stale on arrival");
            sink.send(
                &request.sender,
                Reply::text(Status::SocketTimeout, "Socket queue timeout."),
            );
            return;
        }

        match request.command.as_str() {
            "get_statistics" => sink.send(&request.sender, self.statistics()),
            "get_max_diff_time" => {
                let current = self.max_diff_time_ms.load(Ordering::SeqCst);
                sink.send(&request.sender, Reply::ok(current));
            }
            "set_max_diff_time" => sink.send(&request.sender, self.set_max_diff_time(&request)),
            "get_max_time_exec_threshold" => {
                let current = self.watchdog.max_execution_time().as_millis() as u64;
                sink.send(&request.sender, Reply::ok(current));
            }
            "set_max_time_exec_threshold" => {
                sink.send(&request.sender, self.set_exec_threshold(&request));
            }
            "get_require_cache_file" => {
                sink.send(&request.sender, self.get_cache_file(&request));
            }
            "update_require_cache_file" => {
                sink.send(&request.sender, self.update_cache_file(&request));
            }
            "get_priorities" => {
                let props = self
                    .priorities
                    .snapshot()
                    .into_iter()
                    .map(|(command, priority)| (command, JsonValue::from(priority)))
                    .collect();
                sink.send(
                    &request.sender,
                    Reply::Props {
                        status: Status::Ok,
                        props,
                    },
                );
            }
            "set_priority" => sink.send(&request.sender, self.set_priority(&request)),
            "remove_priority" => {
                let reply = match text_args::<1>(&request) {
                    Some([command]) => {
                        let removed = self.priorities.remove(command) as u64;
                        Reply::ok(removed)
                    }
                    None => invalid_args(&request.command),
                };
                sink.send(&request.sender, reply);
            }
            _ => self.enqueue_work(request, sink),
        }
    }

    /// Reads the current staleness window in milliseconds.
    #[must_use]
    pub fn max_diff_time_ms(&self) -> u64 {
        self.max_diff_time_ms.load(Ordering::SeqCst)
    }

    fn enqueue_work(&self, request: Request, sink: &Arc<dyn ReplySink>) {
        let priority = self.priorities.get(&request.command);
        let submitted_at = Instant::now();
        let sender = request.sender.clone();

        let registry = Arc::clone(&self.registry);
        let max_diff_ms = Arc::clone(&self.max_diff_time_ms);
        let job_sink = Arc::clone(sink);
        let job = Box::new(move |worker: usize| {
            let reply = catch_unwind(AssertUnwindSafe(|| {
                run_work(&registry, &max_diff_ms, worker, submitted_at, &request)
            }))
            .unwrap_or_else(|_| {
                tracing::error!(command = %request.command, "work command panicked");
                Reply::text(Status::Err, "unexpected")
            });
            job_sink.send(&request.sender, reply);
        });

        if let Err(e) = self.pool.submit(priority, job) {
            tracing::warn!(error = %e, "work submission rejected");
            sink.send(
                &sender,
                Reply::text(Status::ThreadPoolExhausted, "Thread pool exhausted."),
            );
        }
    }

    fn statistics(&self) -> Reply {
        let per_worker: Vec<JsonValue> = self
            .pool
            .jobs_per_worker()
            .into_iter()
            .enumerate()
            .map(|(worker, done)| serde_json::json!([worker, done]))
            .collect();

        Reply::Props {
            status: Status::Ok,
            props: vec![
                ("pool_threads".into(), JsonValue::from(self.pool.thread_count() as u64)),
                ("engines".into(), JsonValue::from(self.registry.engine_count() as u64)),
                ("busy".into(), JsonValue::from(self.pool.busy_workers() as u64)),
                ("jobs_left".into(), JsonValue::from(self.pool.jobs_pending() as u64)),
                ("jobs_per_thread".into(), JsonValue::Array(per_worker)),
            ],
        }
    }

    fn set_max_diff_time(&self, request: &Request) -> Reply {
        match int_arg(request) {
            Some(ms) => {
                self.max_diff_time_ms.store(ms, Ordering::SeqCst);
                tracing::info!(max_diff_ms = ms, "staleness window updated");
                Reply::ok(ms)
            }
            None => invalid_args(&request.command),
        }
    }

    fn set_exec_threshold(&self, request: &Request) -> Reply {
        match int_arg(request) {
            Some(ms) => {
                self.watchdog.set_max_execution_time(Duration::from_millis(ms));
                Reply::ok(ms)
            }
            None => invalid_args(&request.command),
        }
    }

    fn get_cache_file(&self, request: &Request) -> Reply {
        match text_args::<1>(request) {
            Some([name]) => match self.modules.get(name) {
                Ok(content) => Reply::ok(content),
                Err(e) => Reply::text(e.status(), e.to_string()),
            },
            None => invalid_args(&request.command),
        }
    }

    fn update_cache_file(&self, request: &Request) -> Reply {
        match text_args::<1>(request) {
            Some([name]) => match self.modules.update(name) {
                Ok(_) => Reply::text(Status::Ok, ""),
                Err(e) => Reply::text(e.status(), e.to_string()),
            },
            None => invalid_args(&request.command),
        }
    }

    fn set_priority(&self, request: &Request) -> Reply {
        let (command, priority) = match (request.args.first(), request.args.get(1)) {
            (Some(cmd), Some(pri)) if request.args.len() == 2 => {
                match (cmd.as_text(), pri.as_int()) {
                    (Some(cmd), Some(pri)) => (cmd.to_string(), pri),
                    _ => return invalid_args(&request.command),
                }
            }
            _ => return invalid_args(&request.command),
        };

        self.priorities.set(command.clone(), priority);
        Reply::Priority {
            status: Status::Ok,
            command,
            priority,
        }
    }
}

/// Body of a work job, run on a worker thread after dequeue.
fn run_work(
    registry: &Registry,
    max_diff_ms: &AtomicU64,
    worker: usize,
    submitted_at: Instant,
    request: &Request,
) -> Reply {
    let max_diff = Duration::from_millis(max_diff_ms.load(Ordering::SeqCst));
    if submitted_at.elapsed() > max_diff {
        return Reply::text(Status::ThreadPoolTimeout, "Threadpool queue timeout.");
    }

    match request.command.as_str() {
        "check_code" => match text_args::<2>(request) {
            Some([source, _payload]) => match registry.check_code(source) {
                Ok(()) => Reply::text(Status::Ok, "Code compiled."),
                Err(e) => Reply::text(e.status(), e.to_string()),
            },
            None => invalid_args(&request.command),
        },
        "compile" => match text_args::<3>(request) {
            Some([conv, node, source]) => {
                let result = registry.compile(&ConvId::from(conv), &NodeId::from(node), source);
                match result {
                    Ok(()) => Reply::text(Status::Ok, ""),
                    Err(e) => Reply::text(e.status(), e.to_string()),
                }
            }
            None => invalid_args(&request.command),
        },
        "remove" => match text_args::<2>(request) {
            Some([conv, node]) => {
                registry.remove(&ConvId::from(conv), &NodeId::from(node));
                Reply::text(Status::Ok, "")
            }
            None => invalid_args(&request.command),
        },
        "run" => match text_args::<3>(request) {
            Some([conv, node, payload]) => {
                let result =
                    registry.run(&ConvId::from(conv), &NodeId::from(node), payload, worker);
                match result {
                    Ok(json) => Reply::ok(json),
                    Err(e) => Reply::text(e.status(), e.to_string()),
                }
            }
            None => invalid_args(&request.command),
        },
        _ => Reply::text(Status::Err, "Unsupported command."),
    }
}

/// Milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Extracts exactly `N` text arguments, or nothing.
fn text_args<const N: usize>(request: &Request) -> Option<[&str; N]> {
    if request.args.len() != N {
        return None;
    }
    let mut out = [""; N];
    for (i, arg) in request.args.iter().enumerate() {
        out[i] = arg.as_text()?;
    }
    Some(out)
}

/// Extracts a single non-negative integer argument.
fn int_arg(request: &Request) -> Option<u64> {
    if request.args.len() != 1 {
        return None;
    }
    request.args[0].as_int().and_then(|n| u64::try_from(n).ok())
}

fn invalid_args(command: &str) -> Reply {
    Reply::text(Status::Err, format!("Invalid arguments for '{command}'."))
}
