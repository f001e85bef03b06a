//! Master/worker conversations over localhost TCP.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gradmesh::codec;
use gradmesh::errors::Result;
use gradmesh::server::master::Master;
use gradmesh::server::protocol::{self, Request, Response, STATUS_VERSION_MISMATCH};
use gradmesh::server::worker::{self, WorkerConfig};
use gradmesh::{Graph, Tensor, Training};

fn start_master(port: u16, chunk: usize) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let handle = thread::spawn(move || {
        Master::new(port, None)
            .with_chunk(chunk)
            .run(flag)
            .expect("master run");
    });
    wait_for_master(port);
    (shutdown, handle)
}

fn wait_for_master(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        assert!(Instant::now() < deadline, "master did not come up");
        thread::sleep(Duration::from_millis(10));
    }
}

fn open(port: u16) -> (BufReader<TcpStream>, BufWriter<TcpStream>) {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    (
        BufReader::new(stream.try_clone().expect("clone")),
        BufWriter::new(stream),
    )
}

/// One request on a fresh connection.
fn rpc(port: u16, request: &Request) -> Response {
    let (mut reader, mut writer) = open(port);
    protocol::write_frame(&mut writer, request).expect("write");
    protocol::read_frame(&mut reader).expect("read")
}

/// Stitch chunked GetWeights responses on a single connection.
fn pull(port: u16) -> (Vec<u8>, String) {
    let (mut reader, mut writer) = open(port);
    let mut buffer = Vec::new();
    loop {
        protocol::write_frame(
            &mut writer,
            &Request::GetWeights {
                version: None,
                position: buffer.len() as u64,
            },
        )
        .unwrap();
        match protocol::read_frame(&mut reader).unwrap() {
            Response::GetWeights {
                version,
                buffer: chunk,
                complete,
            } => {
                buffer.extend_from_slice(&chunk);
                if complete {
                    return (buffer, version);
                }
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}

fn seed_weights(port: u16, bytes: &[u8]) -> String {
    match rpc(
        port,
        &Request::SetWeights {
            version: None,
            buffer: bytes.to_vec(),
            complete: true,
        },
    ) {
        Response::SetWeights { version } => version,
        other => panic!("seed rejected: {other:?}"),
    }
}

#[test]
fn chunked_pull_reassembles_the_buffer() {
    let port = 49361;
    let (shutdown, handle) = start_master(port, 16);

    let weights = codec::encode_variables(&[Tensor::full(10, 10, 1.25)]).unwrap();
    assert!(weights.len() > 16 * 3);
    seed_weights(port, &weights);

    let (pulled, _version) = pull(port);
    assert_eq!(pulled, weights);

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn chunked_push_streams_a_delta() {
    let port = 49362;
    let (shutdown, handle) = start_master(port, 1024);

    let weights = codec::encode_variables(&[Tensor::full(8, 8, 1.0)]).unwrap();
    let version = seed_weights(port, &weights);

    // Send an UpdWeights stream split into small chunks by hand.
    let delta = codec::encode_variables(&[Tensor::full(8, 8, 0.5)]).unwrap();
    let (mut reader, mut writer) = open(port);
    let chunk = 32;
    let mut sent = 0;
    let new_version = loop {
        let end = (sent + chunk).min(delta.len());
        let complete = end == delta.len();
        protocol::write_frame(
            &mut writer,
            &Request::UpdWeights {
                version: Some(version.clone()),
                buffer: delta[sent..end].to_vec(),
                complete,
            },
        )
        .unwrap();
        match protocol::read_frame(&mut reader).unwrap() {
            Response::Success if !complete => {}
            Response::UpdWeights { version } if complete => break version,
            other => panic!("unexpected response: {other:?}"),
        }
        sent = end;
    };
    assert_ne!(new_version, version);

    let (merged, _) = pull(port);
    let tensors = codec::decode_variables(&merged).unwrap();
    assert!(tensors[0].is_approx(&Tensor::full(8, 8, 1.5), 1e-6));

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn first_write_wins_and_stale_sets_are_rejected() {
    let port = 49363;
    let (shutdown, handle) = start_master(port, 1024);

    let weights = codec::encode_variables(&[Tensor::full(2, 2, 1.0)]).unwrap();
    let version = seed_weights(port, &weights);

    // A second unversioned seed must lose.
    let other = codec::encode_variables(&[Tensor::full(2, 2, 9.0)]).unwrap();
    match rpc(
        port,
        &Request::SetWeights {
            version: None,
            buffer: other.clone(),
            complete: true,
        },
    ) {
        Response::Error { status, .. } => assert_eq!(status, STATUS_VERSION_MISMATCH),
        resp => panic!("unversioned overwrite accepted: {resp:?}"),
    }

    // A correctly versioned replacement wins.
    match rpc(
        port,
        &Request::SetWeights {
            version: Some(version),
            buffer: other.clone(),
            complete: true,
        },
    ) {
        Response::SetWeights { .. } => {}
        resp => panic!("versioned set rejected: {resp:?}"),
    }
    let (current, _) = pull(port);
    assert_eq!(current, other);

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn stale_updates_are_rejected_with_version_mismatch() {
    let port = 49364;
    let (shutdown, handle) = start_master(port, 1024);

    let weights = codec::encode_variables(&[Tensor::full(2, 2, 0.0)]).unwrap();
    seed_weights(port, &weights);

    let delta = codec::encode_variables(&[Tensor::full(2, 2, 1.0)]).unwrap();
    match rpc(
        port,
        &Request::UpdWeights {
            version: Some("stale-token".into()),
            buffer: delta,
            complete: true,
        },
    ) {
        Response::Error { status, .. } => assert_eq!(status, STATUS_VERSION_MISMATCH),
        resp => panic!("stale update accepted: {resp:?}"),
    }

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn concurrent_worker_deltas_all_merge() {
    let port = 49365;
    let (shutdown, handle) = start_master(port, 1024);

    let initial = codec::encode_variables(&[Tensor::full(2, 2, 10.0)]).unwrap();
    seed_weights(port, &initial);

    let mut pushers = Vec::new();
    for i in 1..=3u32 {
        pushers.push(thread::spawn(move || {
            let delta = codec::encode_variables(&[Tensor::full(2, 2, i as f32)]).unwrap();
            // Retry under version races until the master takes the delta.
            loop {
                let (_weights, version) = pull(port);
                match rpc(
                    port,
                    &Request::UpdWeights {
                        version: Some(version),
                        buffer: delta.clone(),
                        complete: true,
                    },
                ) {
                    Response::UpdWeights { .. } => return,
                    Response::Error { status, .. } if status == STATUS_VERSION_MISMATCH => {}
                    other => panic!("unexpected response: {other:?}"),
                }
            }
        }));
    }
    for p in pushers {
        p.join().unwrap();
    }

    let (merged, _) = pull(port);
    let tensors = codec::decode_variables(&merged).unwrap();
    // 10 + 1 + 2 + 3 in every element.
    assert!(tensors[0].is_approx(&Tensor::full(2, 2, 16.0), 1e-5));

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn master_persists_weights_across_restarts() {
    let dir = std::env::temp_dir().join("gradmesh-master-test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("weights.bin");
    let _ = std::fs::remove_file(&path);

    let port = 49366;
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let path_clone = path.clone();
    let handle = thread::spawn(move || {
        Master::new(port, Some(path_clone)).run(flag).unwrap();
    });
    wait_for_master(port);

    let weights = codec::encode_variables(&[Tensor::full(3, 3, 4.5)]).unwrap();
    seed_weights(port, &weights);
    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), weights);

    // A fresh master on the same path serves the persisted buffer.
    let port2 = 49367;
    let shutdown2 = Arc::new(AtomicBool::new(false));
    let flag2 = Arc::clone(&shutdown2);
    let path_clone = path.clone();
    let handle2 = thread::spawn(move || {
        Master::new(port2, Some(path_clone)).run(flag2).unwrap();
    });
    wait_for_master(port2);
    let (loaded, _) = pull(port2);
    assert_eq!(loaded, weights);

    shutdown2.store(true, Ordering::Relaxed);
    handle2.join().unwrap();
}

/// One-variable model whose training step adds 1 to every weight.
struct CountingModel {
    curr: Graph,
    prev: Graph,
}

impl CountingModel {
    fn new() -> Self {
        let mut curr = Graph::with_seed(1);
        let mut prev = Graph::with_seed(1);
        curr.variable_from(Tensor::zeros(1, 2));
        prev.variable_from(Tensor::zeros(1, 2));
        Self { curr, prev }
    }
}

impl Training for CountingModel {
    fn curr(&mut self) -> &mut Graph {
        &mut self.curr
    }

    fn prev(&mut self) -> &mut Graph {
        &mut self.prev
    }

    fn batch_train(&mut self) -> Result<()> {
        let ids: Vec<_> = self.curr.variables().to_vec();
        for id in ids {
            let (value, _) = self.curr.variable_parts_mut(id);
            for v in value.as_slice_mut() {
                *v += 1.0;
            }
        }
        Ok(())
    }
}

#[test]
fn worker_loop_trains_against_the_master() {
    let port = 49368;
    let (shutdown, master_handle) = start_master(port, 1024);

    let worker_shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&worker_shutdown);
    let worker_handle = thread::spawn(move || {
        let mut config = WorkerConfig::new("127.0.0.1", port);
        config.threads = 2;
        config.batches_per_sync = 1;
        worker::run(
            &config,
            |_idx| Ok(Box::new(CountingModel::new()) as Box<dyn Training>),
            &flag,
        )
        .unwrap();
    });

    thread::sleep(Duration::from_millis(800));
    worker_shutdown.store(true, Ordering::Relaxed);
    worker_handle.join().unwrap();

    let (merged, _) = pull(port);
    let tensors = codec::decode_variables(&merged).unwrap();
    assert_eq!(tensors.len(), 1);
    // The empty master was seeded with zeros, then at least one +1 delta
    // landed.
    assert!(tensors[0].get(0, 0) >= 1.0, "weights {:?}", tensors[0].as_slice());

    shutdown.store(true, Ordering::Relaxed);
    master_handle.join().unwrap();
}
