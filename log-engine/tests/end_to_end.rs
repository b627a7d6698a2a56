// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine-level scenarios over real sockets: accept → parse → queue →
//! deliver, and fork acknowledgement aggregation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log_engine::config::SourceConfig;
use log_engine::dest::{DestTarget, DestinationNode, DestinationWorker, SharedQueue};
use log_engine::source::SocketSource;
use log_engine::worker::WorkerPool;
use log_event::{AckOutcome, LogRecord, PathOptions};
use log_pipeline::{Fork, NodeRef, PipelineNode, Template, TemplateOptions};
use log_queue::{LogQueue, MemQueue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn mem_queue() -> SharedQueue {
    Arc::new(Mutex::new(Box::new(MemQueue::new(10_000)) as Box<dyn LogQueue>))
}

fn destination(
    id: &str,
    queue: &SharedQueue,
    template: &str,
    target: DestTarget,
) -> (NodeRef, DestinationWorker) {
    let notify = Arc::new(Notify::new());
    let node: NodeRef = Arc::new(DestinationNode::new(
        id.to_string(),
        Arc::clone(queue),
        Arc::clone(&notify),
    ));
    let worker = DestinationWorker::new(
        id.to_string(),
        Arc::clone(queue),
        notify,
        Template::compile(template).unwrap(),
        TemplateOptions::default(),
        target,
        Arc::new(Default::default()),
    );
    (node, worker)
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !probe() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Feed one RFC 5424 line into a freshly opened server; it must come
/// out of the destination re-rendered, and the queue must drain.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accept_route_deliver() {
    // downstream sink the destination forwards to
    let sink = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sink_addr = sink.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink_lines = Arc::clone(&received);
    tokio::spawn(async move {
        let (stream, _) = sink.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink_lines.lock().unwrap().push(line);
        }
    });

    let queue = mem_queue();
    let (node, worker) = destination(
        "forward",
        &queue,
        "$ISODATE|$HOST|$PROGRAM|$PID|$MSGID|$MESSAGE\n",
        DestTarget::Tcp {
            address: sink_addr.to_string(),
        },
    );
    let mut pool = WorkerPool::new();
    pool.spawn("forward", &Handle::current(), move |checkpoint| {
        worker.run(checkpoint)
    });

    // engine source wired straight to the destination node
    let source_cfg = SourceConfig {
        id: "test-in".into(),
        listen: "127.0.0.1:0".into(),
        transport: Default::default(),
        tls: None,
        proxy_protocol: false,
        flow_control: true,
    };
    let (source, addr) = SocketSource::bind(&source_cfg, node, CancellationToken::new())
        .await
        .unwrap();
    tokio::spawn(source.run());

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"<13>1 2024-03-10T12:34:56.789Z host app 123 ID - hello\n")
        .await
        .unwrap();
    client.flush().await.unwrap();

    wait_until(|| !received.lock().unwrap().is_empty()).await;
    let line = received.lock().unwrap()[0].clone();
    assert_eq!(line, "2024-03-10T12:34:56.789+00:00|host|app|123|ID|hello");

    // delivered and acked: the queue drained completely
    wait_until(|| {
        let queue = queue.lock().unwrap();
        queue.len() == 0 && queue.memory_usage_bytes() == 0
    })
    .await;
}

/// One record forked to two destinations acks its source exactly once,
/// after both deliveries.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forked_delivery_acks_once() {
    let dir = tempfile::tempdir().unwrap();
    let left_path = dir.path().join("left.log");
    let right_path = dir.path().join("right.log");

    let left_queue = mem_queue();
    let right_queue = mem_queue();
    let (left_node, left_worker) = destination(
        "left",
        &left_queue,
        "$MESSAGE\n",
        DestTarget::File {
            path: left_path.clone(),
        },
    );
    let (right_node, right_worker) = destination(
        "right",
        &right_queue,
        "$MESSAGE\n",
        DestTarget::File {
            path: right_path.clone(),
        },
    );
    let mut pool = WorkerPool::new();
    pool.spawn("left", &Handle::current(), move |checkpoint| {
        left_worker.run(checkpoint)
    });
    pool.spawn("right", &Handle::current(), move |checkpoint| {
        right_worker.run(checkpoint)
    });

    let fork = Fork::new(vec![left_node, right_node]);

    let acks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&acks);
    let mut record = LogRecord::new_empty();
    record.set_value(
        log_event::builtin::MESSAGE,
        b"fan out this one",
        log_event::ValueType::String,
    );
    record.set_ack_callback(Arc::new(move |_, outcome| {
        assert_eq!(outcome, AckOutcome::Processed);
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let msg = record.into_message();
    let path = PathOptions::with_ack();
    msg.add_ack(&path);
    fork.queue(msg, &path);

    wait_until(|| {
        std::fs::read_to_string(&left_path).is_ok_and(|s| s.contains("fan out"))
            && std::fs::read_to_string(&right_path).is_ok_and(|s| s.contains("fan out"))
    })
    .await;
    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;

    // exactly once, even well after both deliveries
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(acks.load(Ordering::SeqCst), 1);
}
