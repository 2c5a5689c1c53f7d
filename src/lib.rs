// src/lib.rs
//
// Bench acquisition daemon: UART telemetry, UT803 multimeter and SCPI
// oscilloscope readings fanned out to WebSocket clients and archived per
// test session.

#[macro_use]
pub mod logging;

pub mod checksums;
pub mod daemon;
pub mod hub;
pub mod io;
pub mod server;
pub mod sessions;
pub mod settings;
pub mod storage;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::daemon::{spawn_recorder, Daemon, DaemonEvent, RECORDER_QUEUE};
use crate::io::DeviceKind;
use crate::settings::DaemonSettings;
use crate::storage::{PartitionHandle, SqliteStorage, StorageEngine};

/// Worker threads available for blocking device calls
const BLOCKING_THREADS: usize = 4;

/// Startup options, usually from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub bind: Option<String>,
    pub check_db: bool,
    pub reset_db: bool,
}

pub fn run(options: RunOptions) -> Result<(), String> {
    let settings_path = options.config.unwrap_or_else(settings::default_settings_path);
    let mut settings = settings::load_settings(&settings_path)?;
    if let Some(bind) = options.bind {
        settings.server.bind_address = bind;
    }

    if let Some(log_dir) = &settings.logging.log_dir {
        logging::init_file_logging(log_dir, settings.logging.keep_files)?;
    }

    let storage = Arc::new(SqliteStorage::open(&settings.database_path())?);

    if options.check_db {
        return check_db(storage.as_ref());
    }
    if options.reset_db {
        return reset_db(storage.as_ref());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(BLOCKING_THREADS)
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;

    let result = runtime.block_on(serve_daemon(settings, storage));
    logging::stop_file_logging();
    result
}

async fn serve_daemon(settings: DaemonSettings, storage: Arc<SqliteStorage>) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(&settings.server.bind_address)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", settings.server.bind_address, e))?;

    let (recorder_tx, recorder_rx) = mpsc::channel(RECORDER_QUEUE);
    let mut daemon = Daemon::new(storage.clone(), recorder_tx);
    let recorder = spawn_recorder(storage, daemon.watch_session(), recorder_rx);

    let (sources_tx, sources_rx) = mpsc::channel(256);
    daemon.add_configured_pollers(&settings, sources_tx);
    daemon.start_all().await;

    let (events_tx, events_rx) = mpsc::channel(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server::serve(
        listener,
        events_tx.clone(),
        Duration::from_millis(settings.server.send_timeout_ms),
        shutdown_rx,
    ));
    let event_loop = tokio::spawn(daemon.run(events_rx, sources_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tlog!("[daemon] Failed to listen for Ctrl-C: {}", e);
    }
    tlog!("[daemon] Shutting down");

    let _ = shutdown_tx.send(true);
    let _ = events_tx.send(DaemonEvent::Shutdown).await;
    let _ = server.await;
    let _ = event_loop.await;
    // The recorder drains once the event loop has dropped its sender
    let _ = tokio::time::timeout(Duration::from_secs(5), recorder).await;
    Ok(())
}

/// Print the row count of every partition.
fn check_db(storage: &dyn StorageEngine) -> Result<(), String> {
    let sessions = storage
        .list_sessions()
        .map_err(|e| format!("Failed to list sessions: {}", e))?;

    let partitions = DeviceKind::ALL
        .iter()
        .map(|&kind| PartitionHandle::live(kind))
        .chain(
            sessions
                .iter()
                .flat_map(|&id| DeviceKind::ALL.iter().map(move |&kind| PartitionHandle::session(id, kind))),
        );

    println!("{:<24} {:>10}", "partition", "rows");
    for partition in partitions {
        match storage.count(&partition) {
            Ok(rows) => println!("{:<24} {:>10}", partition.name(), rows),
            Err(e) => println!("{:<24} {:>10}", partition.name(), format!("error: {}", e)),
        }
    }
    println!("{} session(s)", sessions.len());
    Ok(())
}

/// Drop every session partition after an interactive confirmation.
fn reset_db(storage: &dyn StorageEngine) -> Result<(), String> {
    print!("This deletes all stored readings and sessions. Continue? [y/N] ");
    std::io::stdout()
        .flush()
        .map_err(|e| format!("Failed to write prompt: {}", e))?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| format!("Failed to read answer: {}", e))?;

    if !matches!(answer.trim(), "y" | "Y" | "yes") {
        println!("Aborted");
        return Ok(());
    }
    storage
        .reset()
        .map_err(|e| format!("Failed to reset database: {}", e))?;
    println!("Database reset");
    Ok(())
}
