//! skald - multi-tenant Lua script execution service.
//!
//! The binary connects out to its supervisor, announces itself with
//! the assigned id and shared cookie, and then serves length-prefixed
//! request frames until the supervisor closes the link.
//!
//! # Startup parameters
//!
//! Positional, in supervisor launch order: library root, engine heap
//! budget in GiB, assigned service id, supervisor address, auth
//! cookie. Worker count, backlog bound, and frame size limit have
//! flags with the standard defaults.
//!
//! # Logging
//!
//! `tracing` with an `RUST_LOG` environment filter; default level is
//! `info`.

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use skald_engine::ModuleCache;
use skald_proto::{read_frame, write_frame, Hello, ProtoError, Reply, ReplyEnvelope, Request};
use skald_runtime::{
    Dispatcher, DispatcherConfig, EnginePool, Registry, ReplySink, Watchdog, WatchdogConfig,
    WorkerPool,
};
use skald_types::{DEFAULT_MAX_QUEUE_SIZE, DEFAULT_READ_BUFFER, DEFAULT_WORKER_COUNT};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Multi-tenant Lua script execution service.
#[derive(Parser, Debug)]
#[command(name = "skald", version, about, long_about = None)]
struct Args {
    /// Absolute path to the script library root
    lib_path: PathBuf,

    /// Engine heap budget, GiB per engine
    max_ram: usize,

    /// Supervisor-assigned service id
    node_id: u32,

    /// Supervisor address (host:port)
    supervisor: String,

    /// Shared auth cookie
    cookie: String,

    /// Worker thread count (one engine per worker)
    #[arg(long, default_value_t = DEFAULT_WORKER_COUNT)]
    workers: usize,

    /// Worker pool backlog bound
    #[arg(long, default_value_t = DEFAULT_MAX_QUEUE_SIZE)]
    max_queue: usize,

    /// Transport frame size limit, bytes
    #[arg(long, default_value_t = DEFAULT_READ_BUFFER)]
    read_buffer: usize,
}

/// Writes reply frames back to the supervisor stream.
struct TcpSink {
    stream: Mutex<TcpStream>,
}

impl ReplySink for TcpSink {
    fn send(&self, to: &str, reply: Reply) {
        let envelope = ReplyEnvelope {
            to: to.to_string(),
            reply,
        };
        match envelope.encode() {
            Ok(body) => {
                let mut stream = self.stream.lock();
                if let Err(e) = write_frame(&mut *stream, &body) {
                    error!(error = %e, "failed to write reply frame");
                }
            }
            Err(e) => error!(error = %e, "failed to encode reply"),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!(
        lib_path = %args.lib_path.display(),
        workers = args.workers,
        "starting skald"
    );

    let modules = Arc::new(ModuleCache::load(&args.lib_path));
    let memory_limit = Some(args.max_ram * 1024 * 1024 * 1024);

    let engines = Arc::new(
        EnginePool::new(args.workers, memory_limit, &modules)
            .context("engine pool startup failed")?,
    );
    let watchdog = Watchdog::spawn(Arc::clone(&engines), args.workers, WatchdogConfig::default())
        .context("watchdog startup failed")?;
    let registry = Arc::new(Registry::new(
        engines,
        Arc::clone(&modules),
        Arc::clone(&watchdog),
        memory_limit,
    ));
    let pool = Arc::new(
        WorkerPool::new(args.workers, args.max_queue).context("worker pool startup failed")?,
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        Arc::clone(&watchdog),
        modules,
        DispatcherConfig::default(),
    ));

    let stream = TcpStream::connect(&args.supervisor)
        .with_context(|| format!("could not connect to supervisor at {}", args.supervisor))?;
    let mut reader = stream
        .try_clone()
        .context("could not clone supervisor stream")?;

    // Announce ourselves before serving.
    let hello = Hello {
        node_id: args.node_id,
        cookie: args.cookie.clone(),
    };
    {
        let mut writer = stream.try_clone().context("could not clone supervisor stream")?;
        let body = serde_json::to_vec(&hello).context("could not encode handshake")?;
        write_frame(&mut writer, &body).context("handshake failed")?;
    }
    info!(supervisor = %args.supervisor, node_id = args.node_id, "connected");

    let sink: Arc<dyn ReplySink> = Arc::new(TcpSink {
        stream: Mutex::new(stream),
    });

    loop {
        match read_frame(&mut reader, args.read_buffer) {
            Ok(Some(body)) => match Request::decode(&body) {
                Ok(request) => dispatcher.dispatch(request, &sink),
                Err(e) => warn!(error = %e, "dropping malformed request frame"),
            },
            Ok(None) => {
                info!("supervisor closed the connection");
                break;
            }
            Err(e) => {
                // The stream cannot be resynchronized after a framing
                // failure, so any read error ends the session.
                error!(error = %e, "transport failure");
                if matches!(e, ProtoError::FrameTooLarge { .. }) {
                    error!(limit = args.read_buffer, "raise --read-buffer to accept larger frames");
                }
                break;
            }
        }
    }

    info!("draining worker pool");
    pool.shutdown(true);
    watchdog.stop();
    registry.clean_all();
    info!("skald stopped");
    Ok(())
}
