use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bss_client::{FetchBatch, StaticUpstream};
use bss_core::{Esaf, EsafId, RawText, SectorId, Station, Timestamp, User, UserList};
use bss_daemon::{paths::socket_path, request_status, request_stop, request_sync, run_with_driver};
use bss_sync::{
    Backoff, DriverOptions, MemoryBroadcast, SelectionPolicy, Status, SyncDriver, SyncState,
};
use serde_json::Value;
use tempfile::TempDir;

fn long_esaf() -> Esaf {
    Esaf {
        id: EsafId(226319),
        title: "Commission 9ID and USAXS".into(),
        description: "Commissioning".into(),
        run: "2020-2".into(),
        sector: SectorId::from("09"),
        start: Timestamp::parse("2000-01-01 00:00:00").expect("start"),
        end: Timestamp::parse("2099-12-31 00:00:00").expect("end"),
        status: "Approved".into(),
        users: UserList::new(vec![User {
            badge: "86312".into(),
            first_name: "Jan".into(),
            last_name: "Ilavsky".into(),
            ..User::default()
        }]),
        raw: RawText::default(),
    }
}

fn driver(broadcast: MemoryBroadcast, clear_on_stop: bool) -> SyncDriver {
    let upstream = StaticUpstream::new();
    upstream.set_esafs(Ok(FetchBatch::new(vec![long_esaf()])));
    SyncDriver::new(
        Arc::new(upstream),
        Box::new(broadcast),
        DriverOptions {
            station: Station {
                sector: SectorId::from("09"),
                beamline: None,
            },
            prefix: "9id:bss:".into(),
            policy: SelectionPolicy::default(),
            idle_status: Status::Ok,
            backoff: Backoff::default(),
            clear_on_stop,
        },
    )
}

async fn blocking<T: Send + 'static>(
    home: PathBuf,
    f: impl FnOnce(&std::path::Path) -> T + Send + 'static,
) -> T {
    tokio::task::spawn_blocking(move || f(&home))
        .await
        .expect("blocking call")
}

async fn wait_for_socket(home: &std::path::Path) {
    let socket = socket_path(home);
    for _ in 0..100 {
        if socket.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon socket never appeared at {}", socket.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_sync_and_stop_over_the_socket() {
    let home = TempDir::new().expect("home");
    let broadcast = MemoryBroadcast::new();
    let daemon = tokio::spawn(run_with_driver(
        home.path().to_path_buf(),
        driver(broadcast.clone(), false),
        Duration::from_secs(3600),
    ));
    wait_for_socket(home.path()).await;

    let status = blocking(home.path().to_path_buf(), |h| request_status(h))
        .await
        .expect("status");
    assert!(status.running);
    assert_eq!(status.interval_secs, 3600);
    assert_eq!(status.socket, socket_path(home.path()));

    let report = blocking(home.path().to_path_buf(), |h| request_sync(h))
        .await
        .expect("sync");
    assert_eq!(report.status, Status::Ok);
    assert_eq!(report.esaf_id, Some(226319));
    assert_eq!(broadcast.get("9id:bss:esaf:id").as_deref(), Some("226319"));
    assert_eq!(broadcast.get("9id:bss:status").as_deref(), Some("ok"));

    // The status mirror catches up asynchronously.
    let mut mirrored = None;
    for _ in 0..50 {
        let status = blocking(home.path().to_path_buf(), |h| request_status(h))
            .await
            .expect("status after sync");
        if status.status.is_some() {
            mirrored = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mirrored = mirrored.expect("status never mirrored the cycle");
    assert_eq!(mirrored.status, Some(Status::Ok));
    assert_eq!(mirrored.state, Some(SyncState::Idle));
    assert_eq!(mirrored.last_cycle.and_then(|r| r.esaf_id), Some(226319));

    let ack = blocking(home.path().to_path_buf(), |h| request_stop(h))
        .await
        .expect("stop");
    assert!(ack.stopping);
    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon exits after stop")
        .expect("join")
        .expect("daemon result");
    assert!(!socket_path(home.path()).exists(), "socket removed on shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_clears_the_table_when_configured() {
    let home = TempDir::new().expect("home");
    let broadcast = MemoryBroadcast::new();
    let daemon = tokio::spawn(run_with_driver(
        home.path().to_path_buf(),
        driver(broadcast.clone(), true),
        Duration::from_secs(3600),
    ));
    wait_for_socket(home.path()).await;

    blocking(home.path().to_path_buf(), |h| request_sync(h))
        .await
        .expect("sync");
    assert_eq!(broadcast.get("9id:bss:esaf:id").as_deref(), Some("226319"));

    blocking(home.path().to_path_buf(), |h| request_stop(h))
        .await
        .expect("stop");
    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon exits after stop")
        .expect("join")
        .expect("daemon result");
    assert_eq!(broadcast.get("9id:bss:esaf:id").as_deref(), Some(""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_daemon_refuses_a_live_socket() {
    let home = TempDir::new().expect("home");
    let first = tokio::spawn(run_with_driver(
        home.path().to_path_buf(),
        driver(MemoryBroadcast::new(), false),
        Duration::from_secs(3600),
    ));
    wait_for_socket(home.path()).await;

    let second = run_with_driver(
        home.path().to_path_buf(),
        driver(MemoryBroadcast::new(), false),
        Duration::from_secs(3600),
    )
    .await;
    assert!(second.is_err(), "second daemon must not steal the socket");

    blocking(home.path().to_path_buf(), |h| request_stop(h))
        .await
        .expect("stop");
    first.await.expect("join").expect("first daemon result");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_command_is_refused_and_the_connection_stays_usable() {
    let home = TempDir::new().expect("home");
    let daemon = tokio::spawn(run_with_driver(
        home.path().to_path_buf(),
        driver(MemoryBroadcast::new(), false),
        Duration::from_secs(3600),
    ));
    wait_for_socket(home.path()).await;

    let replies = blocking(home.path().to_path_buf(), |h| {
        let mut stream = UnixStream::connect(socket_path(h)).expect("connect");
        stream
            .write_all(b"{\"cmd\":\"restart\"}\n{\"cmd\":\"status\"}\n")
            .expect("write");
        let mut reader = BufReader::new(stream);
        let mut replies = Vec::new();
        for _ in 0..2 {
            let mut line = String::new();
            reader.read_line(&mut line).expect("read");
            replies.push(serde_json::from_str::<Value>(&line).expect("json reply"));
        }
        replies
    })
    .await;

    assert_eq!(replies[0]["ok"], Value::Bool(false));
    let error = replies[0]["error"].as_str().unwrap_or_default();
    assert!(error.contains("unknown variant `restart`"), "{error}");
    assert_eq!(replies[1]["ok"], Value::Bool(true));
    assert_eq!(replies[1]["data"]["running"], Value::Bool(true));

    blocking(home.path().to_path_buf(), |h| request_stop(h))
        .await
        .expect("stop");
    daemon.await.expect("join").expect("daemon result");
}
