use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use bss_core::Timestamp;
use bss_sync::{CancelToken, CycleReport, SyncDriver};

use crate::error::{io_err, DaemonError};
use crate::paths::{apsbss_root, socket_path};
use crate::protocol::{DaemonCommand, DaemonRequest, DaemonResponse, DaemonStatus, StopAck};

/// A request for an immediate cycle, answered with that cycle's report.
#[derive(Debug)]
struct SyncJob {
    respond_to: oneshot::Sender<CycleReport>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon from `<home>/.apsbss/config.yaml`: HTTP upstream,
/// snapshot file broadcast.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let settings = bss_core::config::load_at(&home)?.validate()?;
    let driver = bss_sync::driver_at(&home, &settings)?;
    tracing::info!(
        sector = %settings.sector,
        prefix = %settings.prefix,
        interval_secs = settings.interval.as_secs(),
        "starting apsbss daemon",
    );
    run_with_driver(home, driver, settings.interval).await
}

/// Run the daemon around an already built driver. Cycles start `interval`
/// apart (start to start) and never overlap; a degraded driver retries after
/// its backoff delay instead.
pub async fn run_with_driver(
    home: PathBuf,
    mut driver: SyncDriver,
    interval: Duration,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let started_at_unix = unix_seconds_now();
    let cancel = CancelToken::new();
    let reports = driver.subscribe_status();

    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (report_tx, report_rx) = watch::channel::<Option<CycleReport>>(None);

    let mirror_handle = tokio::task::spawn_blocking(move || {
        while let Ok(report) = reports.recv() {
            report_tx.send_replace(Some(report));
        }
        Ok::<(), DaemonError>(())
    });

    let cycle_handle = {
        let shutdown = shutdown_tx.clone();
        let cancel = cancel.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = cycle_task(driver, interval, sync_rx, shutdown_rx, cancel).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let status = StatusContext {
                reports: report_rx,
                started_at_unix,
                interval,
                socket: socket_path(&home),
            };
            let result =
                socket_server_task(home, status, sync_tx, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            cancel.cancel();
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (cycle_result, socket_result, signal_result) =
        tokio::join!(cycle_handle, socket_handle, signal_handle);
    // The driver is dropped with the cycle task, which closes the mirror.
    let mirror_result = mirror_handle.await;

    handle_join("sync_cycle", cycle_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    handle_join("status_mirror", mirror_result)?;
    tracing::info!("apsbss daemon stopped");
    Ok(())
}

/// Owns the driver. Timer ticks and `sync` requests both funnel through this
/// loop, so at most one cycle runs at a time.
async fn cycle_task(
    mut driver: SyncDriver,
    interval: Duration,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
    cancel: CancelToken,
) -> Result<(), DaemonError> {
    let mut delay = Duration::ZERO;
    loop {
        let mut waiting = Vec::new();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(delay) => {}
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };
                waiting.push(job.respond_to);
            }
        }
        // Requests queued meanwhile share this cycle.
        while let Ok(job) = sync_rx.try_recv() {
            waiting.push(job.respond_to);
        }

        let started = Instant::now();
        let (returned, report) = run_cycle(driver, &cancel, &mut shutdown_rx).await?;
        driver = returned;
        for respond_to in waiting {
            let _ = respond_to.send(report.clone());
        }
        if report.cancelled || cancel.is_cancelled() {
            break;
        }

        delay = next_delay(&report, interval, started.elapsed());
        if report.retry_in_ms.is_some() {
            tracing::warn!(
                status = %report.status,
                failures = report.consecutive_failures,
                retry_in_ms = delay.as_millis() as u64,
                "upstream unavailable, backing off",
            );
        }
    }

    tokio::task::spawn_blocking(move || driver.stop())
        .await
        .map_err(|err| DaemonError::Protocol(format!("driver stop join error: {err}")))?;
    Ok(())
}

/// Runs one cycle on the blocking pool. A shutdown arriving mid-cycle
/// cancels it; the driver stops at its next phase boundary.
async fn run_cycle(
    mut driver: SyncDriver,
    cancel: &CancelToken,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(SyncDriver, CycleReport), DaemonError> {
    let token = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        let report = driver.run_cycle(Timestamp::now(), &token);
        (driver, report)
    });

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = shutdown_rx.recv() => {
            cancel.cancel();
            handle.await
        }
    };
    joined.map_err(|err| DaemonError::Protocol(format!("sync cycle join error: {err}")))
}

/// Delay until the next cycle: what is left of the interval, stretched to
/// the driver's backoff after a fetch failure. Retries never come faster
/// than the normal cadence.
fn next_delay(report: &CycleReport, interval: Duration, elapsed: Duration) -> Duration {
    let cadence = interval.saturating_sub(elapsed);
    match report.retry_in_ms {
        Some(ms) => cadence.max(Duration::from_millis(ms)),
        None => cadence,
    }
}

struct StatusContext {
    reports: watch::Receiver<Option<CycleReport>>,
    started_at_unix: u64,
    interval: Duration,
    socket: PathBuf,
}

impl StatusContext {
    fn payload(&self) -> DaemonStatus {
        let last = self.reports.borrow().clone();
        DaemonStatus {
            running: true,
            pid: std::process::id(),
            started_at_unix: self.started_at_unix,
            interval_secs: self.interval.as_secs(),
            socket: self.socket.clone(),
            status: last.as_ref().map(|r| r.status),
            state: last.as_ref().map(|r| r.state),
            last_cycle: last,
        }
    }
}

async fn socket_server_task(
    home: PathBuf,
    status: StatusContext,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening for control requests");

    let status = std::sync::Arc::new(status);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let status = status.clone();
                let sync_tx = sync_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, status, sync_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    status: std::sync::Arc<StatusContext>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let refused = DaemonResponse::<()>::error(format!("invalid request: {err}"));
                write_response(&mut writer, &refused).await?;
                continue;
            }
        };

        match request.cmd {
            DaemonCommand::Status => {
                write_response(&mut writer, &DaemonResponse::ok(status.payload())).await?;
            }
            DaemonCommand::Sync => {
                let response = match enqueue_sync(&sync_tx).await {
                    Ok(report) => DaemonResponse::ok(report),
                    Err(err) => DaemonResponse::error(err.to_string()),
                };
                write_response(&mut writer, &response).await?;
            }
            DaemonCommand::Stop => {
                tracing::info!("stop requested over socket");
                let _ = shutdown_tx.send(());
                write_response(&mut writer, &DaemonResponse::ok(StopAck { stopping: true })).await?;
                break;
            }
        }
    }

    Ok(())
}

async fn enqueue_sync(sync_tx: &mpsc::Sender<SyncJob>) -> Result<CycleReport, DaemonError> {
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob { respond_to: tx })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    rx.await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = apsbss_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    Ok(())
}

async fn write_response<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse<T>,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bss_client::StaticUpstream;
    use bss_core::{FetchError, SectorId, Station};
    use bss_sync::{Backoff, DriverOptions, MemoryBroadcast, SelectionPolicy, Status, SyncState};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn report(retry_in_ms: Option<u64>) -> CycleReport {
        let mut driver = idle_driver(Arc::new(StaticUpstream::new()));
        let mut report = driver.run_cycle(Timestamp::now(), &CancelToken::new());
        report.retry_in_ms = retry_in_ms;
        report
    }

    fn idle_driver(upstream: Arc<StaticUpstream>) -> SyncDriver {
        SyncDriver::new(
            upstream,
            Box::new(MemoryBroadcast::new()),
            DriverOptions {
                station: Station {
                    sector: SectorId::from("09"),
                    beamline: None,
                },
                prefix: "9id:bss:".into(),
                policy: SelectionPolicy::default(),
                idle_status: Status::Ok,
                backoff: Backoff::default(),
                clear_on_stop: false,
            },
        )
    }

    #[test]
    fn next_cycle_keeps_start_to_start_cadence() {
        let delay = next_delay(&report(None), Duration::from_secs(60), Duration::from_secs(4));
        assert_eq!(delay, Duration::from_secs(56));
    }

    #[test]
    fn overrunning_cycle_starts_the_next_immediately() {
        let delay = next_delay(&report(None), Duration::from_secs(60), Duration::from_secs(75));
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn short_backoff_never_beats_the_interval() {
        let delay = next_delay(
            &report(Some(5_000)),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        assert_eq!(delay, Duration::from_secs(59));
    }

    #[test]
    fn long_backoff_stretches_the_wait() {
        let delay = next_delay(
            &report(Some(300_000)),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        assert_eq!(delay, Duration::from_secs(300));
    }

    #[test]
    fn backoff_applies_even_after_an_overrun() {
        let delay = next_delay(
            &report(Some(10_000)),
            Duration::from_secs(60),
            Duration::from_secs(75),
        );
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sync_request_gets_the_cycle_report() {
        let driver = idle_driver(Arc::new(StaticUpstream::new()));
        let (sync_tx, sync_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let cancel = CancelToken::new();

        let task = tokio::spawn(cycle_task(
            driver,
            Duration::from_secs(3600),
            sync_rx,
            shutdown_rx,
            cancel,
        ));

        let report = enqueue_sync(&sync_tx).await.expect("sync report");
        assert_eq!(report.status, Status::Ok);
        assert_eq!(report.state, SyncState::Idle);

        shutdown_tx.send(()).expect("shutdown");
        task.await.expect("join").expect("cycle task");
    }

    #[tokio::test]
    async fn failing_upstream_reports_backoff() {
        let upstream = Arc::new(StaticUpstream::new());
        upstream.fail_with(FetchError::Network("connection refused".into()));
        let driver = idle_driver(upstream.clone());
        let (sync_tx, sync_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);

        let task = tokio::spawn(cycle_task(
            driver,
            Duration::from_secs(3600),
            sync_rx,
            shutdown_rx,
            CancelToken::new(),
        ));

        let report = enqueue_sync(&sync_tx).await.expect("sync report");
        assert!(matches!(report.status, Status::Error | Status::Stale));
        assert_eq!(report.fetch_error.as_deref(), Some("scheduling service unreachable: connection refused"));
        assert!(report.retry_in_ms.is_some());
        assert!(upstream.calls() >= 2);

        shutdown_tx.send(()).expect("shutdown");
        task.await.expect("join").expect("cycle task");
    }

    #[test]
    fn stale_socket_is_removed_before_bind() {
        let home = TempDir::new().expect("home");
        let socket = home.path().join("daemon.sock");
        fs::write(&socket, b"").expect("stale socket file");
        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn status_payload_before_first_cycle() {
        let (_tx, rx) = watch::channel::<Option<CycleReport>>(None);
        let status = StatusContext {
            reports: rx,
            started_at_unix: 1_000_000,
            interval: Duration::from_secs(60),
            socket: PathBuf::from("/tmp/daemon.sock"),
        };
        let payload = status.payload();
        assert!(payload.running);
        assert_eq!(payload.pid, std::process::id());
        assert_eq!(payload.started_at_unix, 1_000_000);
        assert_eq!(payload.interval_secs, 60);
        assert!(payload.last_cycle.is_none());
        assert!(payload.status.is_none());
    }

    #[tokio::test]
    async fn status_payload_mirrors_latest_report() {
        let (tx, rx) = watch::channel::<Option<CycleReport>>(None);
        tx.send_replace(Some(report(None)));
        let status = StatusContext {
            reports: rx,
            started_at_unix: 0,
            interval: Duration::from_secs(60),
            socket: PathBuf::from("/tmp/daemon.sock"),
        };
        let payload = status.payload();
        assert_eq!(payload.status, Some(Status::Ok));
        assert_eq!(payload.state, Some(SyncState::Idle));
        assert_eq!(payload.last_cycle.map(|r| r.status), Some(Status::Ok));
    }
}
