//! End-to-end broker tests: a real Unix intake socket, a real TCP
//! "Graylog" on localhost, and the full event loop in between.

use gelf_broker::{Broker, BrokerHandle, Config};
use gelf_client::Publisher;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn test_config(dir: &Path, graylog: &str) -> Config {
    let mut config = Config::from_flags(dir.join("intake.sock"), graylog.to_string());
    config.buffer = Some(dir.join("spool"));
    config.status = Some(dir.join("status"));
    config
}

fn spawn_broker(config: Config) -> (JoinHandle<gelf_broker::Result<()>>, BrokerHandle) {
    let (broker, handle) = Broker::new(config, None, false).expect("broker construction");
    (tokio::spawn(broker.run()), handle)
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Broker-originated frames (self-logs, keep-alives) are JSON objects;
/// the test producers send bare words, so the two are easy to tell apart.
fn is_producer_frame(frame: &str) -> bool {
    !frame.starts_with('{')
}

/// Read NUL-delimited frames until `n` producer frames arrived.
async fn collect_producer_frames(stream: &mut TcpStream, n: usize) -> Vec<String> {
    let mut raw: Vec<u8> = Vec::new();
    let mut frames = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        while let Some(pos) = raw.iter().position(|&b| b == 0) {
            let frame: Vec<u8> = raw.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&frame[..frame.len() - 1]).into_owned();
            if is_producer_frame(&text) {
                frames.push(text);
                if frames.len() == n {
                    return frames;
                }
            }
        }
        let n_read = timeout(Duration::from_secs(20), stream.read(&mut buf))
            .await
            .expect("timed out reading upstream frames")
            .expect("upstream read failed");
        assert!(n_read > 0, "upstream connection closed early");
        raw.extend_from_slice(&buf[..n_read]);
    }
}

#[tokio::test]
async fn records_arrive_upstream_in_send_order() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap();

    let config = test_config(dir.path(), &addr.to_string());
    let socket_path = config.socket.clone();
    let (broker_task, handle) = spawn_broker(config);

    wait_for("intake socket", || socket_path.exists()).await;
    let publisher = Publisher::connect(&socket_path).unwrap();
    publisher.send_raw(b"first").unwrap();
    publisher.send_raw(b"second").unwrap();
    publisher.send_raw(b"third").unwrap();

    let (mut peer, _) = timeout(Duration::from_secs(10), upstream.accept())
        .await
        .expect("broker never connected")
        .unwrap();
    let frames = collect_producer_frames(&mut peer, 3).await;
    assert_eq!(frames, vec!["first", "second", "third"]);

    handle.shutdown();
    broker_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn records_survive_an_upstream_outage() {
    let dir = tempfile::tempdir().unwrap();
    // reserve a port, then refuse connections on it until later
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let config = test_config(dir.path(), &addr.to_string());
    let socket_path = config.socket.clone();
    let (broker_task, handle) = spawn_broker(config);

    wait_for("intake socket", || socket_path.exists()).await;
    let publisher = Publisher::connect(&socket_path).unwrap();
    for word in ["one", "two", "three", "four", "five"] {
        publisher.send_raw(word.as_bytes()).unwrap();
    }

    // give the broker time to fail its connect and queue the records
    tokio::time::sleep(Duration::from_millis(500)).await;

    // the endpoint comes back; the reconnect cycle should find it
    let upstream = TcpListener::bind(addr).await.unwrap();
    let (mut peer, _) = timeout(Duration::from_secs(30), upstream.accept())
        .await
        .expect("broker never reconnected")
        .unwrap();
    let frames = collect_producer_frames(&mut peer, 5).await;
    assert_eq!(frames, vec!["one", "two", "three", "four", "five"]);

    handle.shutdown();
    broker_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn spooled_records_from_a_previous_run_are_delivered_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap();

    let config = test_config(dir.path(), &addr.to_string());
    let buffer = config.buffer.clone().unwrap();

    // a previous run left ten records behind
    let records: Vec<bytes::Bytes> = (1..=10)
        .map(|i| bytes::Bytes::from(format!("record-{:02}", i)))
        .collect();
    gelf_broker::spool::save(&buffer, &records).unwrap();

    let (broker_task, handle) = spawn_broker(config);

    let (mut peer, _) = timeout(Duration::from_secs(10), upstream.accept())
        .await
        .expect("broker never connected")
        .unwrap();
    let frames = collect_producer_frames(&mut peer, 10).await;
    let expected: Vec<String> = (1..=10).map(|i| format!("record-{:02}", i)).collect();
    assert_eq!(frames, expected);

    handle.shutdown();
    broker_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn second_broker_on_the_same_socket_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap();

    let config = test_config(dir.path(), &addr.to_string());
    let socket_path = config.socket.clone();
    let (broker_task, handle) = spawn_broker(config.clone());
    wait_for("intake socket", || socket_path.exists()).await;

    // second instance, same intake socket
    let (second, _handle2) = Broker::new(config, None, false).unwrap();
    let err = second.run().await.expect_err("second broker must refuse to start");
    assert!(
        matches!(
            err,
            gelf_broker::BrokerError::Listener(
                gelf_broker::listener::ListenerError::Conflict { .. }
            )
        ),
        "unexpected error: {}",
        err
    );

    // the first broker is still healthy
    let publisher = Publisher::connect(&socket_path).unwrap();
    publisher.send_raw(b"still-alive").unwrap();
    let (mut peer, _) = timeout(Duration::from_secs(10), upstream.accept())
        .await
        .expect("broker never connected")
        .unwrap();
    let frames = collect_producer_frames(&mut peer, 1).await;
    assert_eq!(frames, vec!["still-alive"]);

    handle.shutdown();
    broker_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn status_file_reports_broker_state() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap();

    let config = test_config(dir.path(), &addr.to_string());
    let status_path = config.status.clone().unwrap();
    let socket_path = config.socket.clone();
    let (broker_task, handle) = spawn_broker(config);

    wait_for("initial status file", || status_path.exists()).await;
    wait_for("intake socket", || socket_path.exists()).await;

    // a fresh snapshot on request, as SIGUSR2 would produce
    handle.write_status();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let raw = std::fs::read_to_string(&status_path).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
    assert_eq!(doc["pid"].as_u64().unwrap(), std::process::id() as u64);
    assert_eq!(
        doc["socket"].as_str().unwrap(),
        socket_path.to_str().unwrap()
    );
    assert_eq!(
        doc["upstream"]["hostport"].as_str().unwrap(),
        addr.to_string()
    );
    assert!(doc["started"].as_str().unwrap().contains('T'));

    handle.shutdown();
    broker_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_spools_the_queue_and_unlinks_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    // nothing ever listens here
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let config = test_config(dir.path(), &addr.to_string());
    let socket_path = config.socket.clone();
    let buffer = config.buffer.clone().unwrap();
    let (broker_task, handle) = spawn_broker(config);

    wait_for("intake socket", || socket_path.exists()).await;
    let publisher = Publisher::connect(&socket_path).unwrap();
    publisher.send_raw(b"queued-1").unwrap();
    publisher.send_raw(b"queued-2").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    handle.shutdown();
    broker_task.await.unwrap().unwrap();

    assert!(!socket_path.exists(), "socket file must be unlinked");

    let spooled = gelf_broker::spool::load(&buffer).unwrap();
    let texts: Vec<String> = spooled
        .iter()
        .map(|r| String::from_utf8_lossy(r).into_owned())
        .collect();
    // self-log records sit at the head; producer records keep their order
    let producer: Vec<&String> = texts.iter().filter(|t| !t.starts_with('{')).collect();
    assert_eq!(producer, vec!["queued-1", "queued-2"]);
    assert!(
        texts.first().unwrap().starts_with('{'),
        "head of the spool should be a self-log record"
    );
}

#[tokio::test]
async fn probe_datagrams_are_not_enqueued() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap();

    let config = test_config(dir.path(), &addr.to_string());
    let socket_path = config.socket.clone();
    let (broker_task, handle) = spawn_broker(config);

    wait_for("intake socket", || socket_path.exists()).await;
    let publisher = Publisher::connect(&socket_path).unwrap();
    for _ in 0..5 {
        publisher.probe().unwrap();
    }
    publisher.send_raw(b"after-probes").unwrap();

    let (mut peer, _) = timeout(Duration::from_secs(10), upstream.accept())
        .await
        .expect("broker never connected")
        .unwrap();
    let frames = collect_producer_frames(&mut peer, 1).await;
    assert_eq!(frames, vec!["after-probes"]);

    handle.shutdown();
    broker_task.await.unwrap().unwrap();
}
