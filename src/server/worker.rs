//! The worker side of the parameter-server loop: pull weights, train
//! locally, push the accumulated delta, resync on version conflicts.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::server::protocol::{
    self, Request, Response, DEFAULT_CHUNK, STATUS_VERSION_MISMATCH,
};
use crate::training::Training;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    /// Training threads; defaults to the CPU core count.
    pub threads: usize,
    /// batch_train calls between weight syncs.
    pub batches_per_sync: usize,
    pub chunk: usize,
}

impl WorkerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let threads = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            host: host.into(),
            port,
            threads,
            batches_per_sync: 1,
            chunk: DEFAULT_CHUNK,
        }
    }
}

/// Run the training loop until `shutdown` is raised. The factory is
/// invoked once per thread; a failing factory aborts the worker before
/// any thread starts.
pub fn run<F>(config: &WorkerConfig, factory: F, shutdown: &AtomicBool) -> Result<()>
where
    F: Fn(usize) -> Result<Box<dyn Training>>,
{
    let mut models = Vec::with_capacity(config.threads);
    for idx in 0..config.threads {
        models.push(factory(idx)?);
    }
    info!(threads = config.threads, "worker starting");

    thread::scope(|scope| {
        for (idx, model) in models.into_iter().enumerate() {
            let config = config.clone();
            scope.spawn(move || train_loop(idx, model, &config, shutdown));
        }
    });
    Ok(())
}

fn train_loop(
    idx: usize,
    mut model: Box<dyn Training>,
    config: &WorkerConfig,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match iteration(&mut model, config) {
            Ok(()) => {}
            Err(Error::VersionMismatch { .. }) => {
                // Stale push: drop the delta and resync on the next pull.
                debug!(worker = idx, "version mismatch, resyncing");
            }
            Err(e) => {
                warn!(worker = idx, error = %e, "iteration failed, backing off");
                thread::sleep(RETRY_BACKOFF);
            }
        }
    }
}

/// One pull / train / push cycle.
fn iteration(model: &mut Box<dyn Training>, config: &WorkerConfig) -> Result<()> {
    let (weights, version) = pull_weights(config)?;

    let version = if weights.is_empty() {
        // Fresh master: seed it with this model's initial weights.
        let seed = model.get_weights()?;
        model.set_weights(&seed)?;
        let version = push_stream(config, &seed, None, StreamKind::Set)?;
        debug!(%version, "seeded master weights");
        version
    } else {
        model.set_weights(&weights)?;
        version
    };

    for _ in 0..config.batches_per_sync.max(1) {
        model.batch_train()?;
    }

    let delta = model.get_update()?;
    push_stream(config, &delta, Some(version), StreamKind::Upd)?;
    Ok(())
}

fn connect(config: &WorkerConfig) -> Result<(BufReader<TcpStream>, BufWriter<TcpStream>)> {
    let stream = TcpStream::connect((config.host.as_str(), config.port))?;
    stream.set_nodelay(true).ok();
    Ok((
        BufReader::new(stream.try_clone()?),
        BufWriter::new(stream),
    ))
}

/// Chunked GetWeights conversation; stitches until `complete`.
fn pull_weights(config: &WorkerConfig) -> Result<(Vec<u8>, String)> {
    let (mut reader, mut writer) = connect(config)?;
    let mut buffer = Vec::new();
    loop {
        protocol::write_frame(
            &mut writer,
            &Request::GetWeights {
                version: None,
                position: buffer.len() as u64,
            },
        )?;
        match protocol::read_frame::<Response, _>(&mut reader)? {
            Response::GetWeights {
                version,
                buffer: chunk,
                complete,
            } => {
                buffer.extend_from_slice(&chunk);
                if complete {
                    return Ok((buffer, version));
                }
            }
            Response::Error { status, message } => {
                return Err(Error::Protocol(format!("get_weights [{status}]: {message}")))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected get_weights response: {other:?}"
                )))
            }
        }
    }
}

enum StreamKind {
    Set,
    Upd,
}

/// Chunked SetWeights/UpdWeights conversation; returns the new version.
fn push_stream(
    config: &WorkerConfig,
    payload: &[u8],
    version: Option<String>,
    kind: StreamKind,
) -> Result<String> {
    let (mut reader, mut writer) = connect(config)?;
    let chunk = config.chunk.clamp(1, protocol::MAX_CHUNK);
    let total = payload.len();
    let mut sent = 0;
    loop {
        let end = (sent + chunk).min(total);
        let complete = end == total;
        let buffer = payload[sent..end].to_vec();
        let request = match kind {
            StreamKind::Set => Request::SetWeights {
                version: version.clone(),
                buffer,
                complete,
            },
            StreamKind::Upd => Request::UpdWeights {
                version: version.clone(),
                buffer,
                complete,
            },
        };
        protocol::write_frame(&mut writer, &request)?;
        match protocol::read_frame::<Response, _>(&mut reader)? {
            Response::Success if !complete => {}
            Response::SetWeights { version } | Response::UpdWeights { version } if complete => {
                return Ok(version)
            }
            Response::Error { status, message } if status == STATUS_VERSION_MISMATCH => {
                return Err(Error::VersionMismatch {
                    have: version,
                    current: message,
                })
            }
            Response::Error { status, message } => {
                return Err(Error::Protocol(format!("push [{status}]: {message}")))
            }
            other => {
                return Err(Error::Protocol(format!("unexpected push response: {other:?}")))
            }
        }
        sent = end;
    }
}
