//! The parameter server: owns the authoritative serialized weights and an
//! opaque version token, merges completed worker deltas, and streams
//! weight chunks to pulling workers.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::server::protocol::{
    self, Request, Response, DEFAULT_CHUNK, STATUS_BAD_REQUEST, STATUS_INTERNAL,
    STATUS_VERSION_MISMATCH,
};
use crate::training;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

struct State {
    weights: Vec<u8>,
    base: String,
    counter: u64,
    version: String,
}

impl State {
    fn new(weights: Vec<u8>) -> Self {
        let base: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let version = format!("{base}-0");
        Self {
            weights,
            base,
            counter: 0,
            version,
        }
    }

    /// Derive the next version token from the prior one.
    fn bump(&mut self) -> String {
        self.counter += 1;
        self.version = format!("{}-{}", self.base, self.counter);
        self.version.clone()
    }
}

pub struct Master {
    port: u16,
    weights_path: Option<PathBuf>,
    chunk: usize,
}

impl Master {
    pub fn new(port: u16, weights_path: Option<PathBuf>) -> Self {
        Self {
            port,
            weights_path,
            chunk: DEFAULT_CHUNK,
        }
    }

    /// Shrink the streaming chunk size (used by tests to exercise
    /// multi-chunk conversations).
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.clamp(1, protocol::MAX_CHUNK);
        self
    }

    /// Accept loop; returns after `shutdown` is raised, persisting the
    /// weight buffer to `weights_path` on the way out.
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let initial = match &self.weights_path {
            Some(path) if path.exists() => {
                let bytes = std::fs::read(path)?;
                info!(path = %path.display(), len = bytes.len(), "loaded weights");
                bytes
            }
            _ => Vec::new(),
        };
        let state = Arc::new(Mutex::new(State::new(initial)));

        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        listener.set_nonblocking(true)?;
        info!(port = self.port, "master listening");

        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "worker connected");
                    let state = Arc::clone(&state);
                    let chunk = self.chunk;
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, state, chunk) {
                            debug!(error = %e, "connection dropped");
                        }
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(path) = &self.weights_path {
            let snapshot = state.lock().expect("master state lock").weights.clone();
            std::fs::write(path, &snapshot)?;
            info!(path = %path.display(), len = snapshot.len(), "persisted weights");
        }
        Ok(())
    }
}

/// One conversation per connection; partial streams die with it.
fn handle_connection(stream: TcpStream, state: Arc<Mutex<State>>, chunk: usize) -> Result<()> {
    stream.set_nodelay(true).ok();
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let mut set_pending: Vec<u8> = Vec::new();
    let mut upd_pending: Vec<u8> = Vec::new();

    loop {
        let request: Request = match protocol::read_frame(&mut reader) {
            Ok(r) => r,
            Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let response = match request {
            Request::GetWeights { position, .. } => {
                let state = state.lock().expect("master state lock");
                let len = state.weights.len() as u64;
                if position > len {
                    Response::Error {
                        status: STATUS_BAD_REQUEST,
                        message: format!("position {position} beyond weights ({len})"),
                    }
                } else {
                    let start = position as usize;
                    let end = (start + chunk).min(state.weights.len());
                    Response::GetWeights {
                        version: state.version.clone(),
                        buffer: state.weights[start..end].to_vec(),
                        complete: end == state.weights.len(),
                    }
                }
            }
            Request::SetWeights {
                version,
                buffer,
                complete,
            } => {
                set_pending.extend_from_slice(&buffer);
                if !complete {
                    Response::Success
                } else {
                    let mut state = state.lock().expect("master state lock");
                    // First write wins: an unversioned set only seeds an
                    // empty master; replacing live weights needs the
                    // current version.
                    let accepted = state.weights.is_empty()
                        || matches!(&version, Some(v) if *v == state.version);
                    if !accepted {
                        set_pending.clear();
                        Response::Error {
                            status: STATUS_VERSION_MISMATCH,
                            message: state.version.clone(),
                        }
                    } else {
                        state.weights = std::mem::take(&mut set_pending);
                        let version = state.bump();
                        info!(len = state.weights.len(), %version, "weights replaced");
                        Response::SetWeights { version }
                    }
                }
            }
            Request::UpdWeights {
                version,
                buffer,
                complete,
            } => {
                upd_pending.extend_from_slice(&buffer);
                if !complete {
                    Response::Success
                } else {
                    let delta = std::mem::take(&mut upd_pending);
                    let mut state = state.lock().expect("master state lock");
                    if matches!(&version, Some(v) if *v != state.version) {
                        Response::Error {
                            status: STATUS_VERSION_MISMATCH,
                            message: state.version.clone(),
                        }
                    } else {
                        match training::apply_delta(&state.weights, &delta) {
                            Ok(merged) => {
                                state.weights = merged;
                                let version = state.bump();
                                debug!(%version, "delta applied");
                                Response::UpdWeights { version }
                            }
                            Err(e) => {
                                warn!(error = %e, "rejecting malformed delta");
                                Response::Error {
                                    status: STATUS_INTERNAL,
                                    message: e.to_string(),
                                }
                            }
                        }
                    }
                }
            }
        };
        protocol::write_frame(&mut writer, &response)?;
    }
}
