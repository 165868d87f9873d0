//! Control-plane subscription feeding the policy store.
//!
//! The client subscribes once with its group and table names, then applies every update the
//! stream delivers, in delivery order, to the store. Ordering across keys is not relied upon:
//! the store's version check makes late or duplicated updates harmless.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown as NetShutdown, SocketAddr, TcpStream};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::maps::MapMirror;
use crate::policy::{PolicyKey, PolicyValue};
use crate::store::{Applied, PolicyStore};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub group: String,
    pub tables: Vec<String>,
}

impl WatchRequest {
    pub fn from_config(config: &SyncConfig) -> WatchRequest {
        WatchRequest {
            group: config.group.clone(),
            tables: vec![
                config.neighbor_table.clone(),
                config.security_group_rules_table.clone(),
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub key: PolicyKey,
    pub version: u64,
    pub payload: PolicyValue,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResponse {
    pub updates: Vec<Update>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("control plane stream: {0}")]
    Io(#[from] io::Error),
    #[error("undecodable control plane message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("control plane went away before the subscription was sent")]
    Disconnected,
}

/// A stream of watch responses.
pub trait UpdateTransport {
    fn subscribe(&mut self, request: &WatchRequest) -> Result<(), SyncError>;

    /// Blocks for the next response. `None` once the stream is closed.
    fn next_response(&mut self) -> Result<Option<WatchResponse>, SyncError>;
}

/// In-process transport over a pair of channels.
#[derive(Debug)]
pub struct ChannelTransport {
    requests: Sender<WatchRequest>,
    responses: Receiver<WatchResponse>,
}

/// The control plane's end of a [`ChannelTransport`]. Dropping it closes the stream.
#[derive(Debug)]
pub struct ChannelServer {
    requests: Receiver<WatchRequest>,
    responses: Sender<WatchResponse>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelServer) {
        let (req_tx, req_rx) = unbounded();
        let (resp_tx, resp_rx) = unbounded();
        (
            ChannelTransport {
                requests: req_tx,
                responses: resp_rx,
            },
            ChannelServer {
                requests: req_rx,
                responses: resp_tx,
            },
        )
    }
}

impl UpdateTransport for ChannelTransport {
    fn subscribe(&mut self, request: &WatchRequest) -> Result<(), SyncError> {
        self.requests
            .send(request.clone())
            .map_err(|_| SyncError::Disconnected)
    }

    fn next_response(&mut self) -> Result<Option<WatchResponse>, SyncError> {
        Ok(self.responses.recv().ok())
    }
}

impl ChannelServer {
    /// Blocks until the client subscribes. `None` if the client is gone.
    pub fn subscription(&self) -> Option<WatchRequest> {
        self.requests.recv().ok()
    }

    /// False if the client is gone.
    pub fn send(&self, response: WatchResponse) -> bool {
        self.responses.send(response).is_ok()
    }
}

/// Newline delimited JSON: one request line out, one response per line back.
#[derive(Debug)]
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
    line: String,
}

impl<R: BufRead, W: Write> LineTransport<R, W> {
    pub fn new(reader: R, writer: W) -> LineTransport<R, W> {
        LineTransport {
            reader,
            writer,
            line: String::new(),
        }
    }
}

impl LineTransport<BufReader<TcpStream>, TcpStream> {
    pub fn connect(addr: SocketAddr) -> Result<Self, SyncError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        info!(%addr, "connected to control plane");
        Ok(LineTransport::new(reader, stream))
    }

    /// A handle that ends the stream from another thread, making `next_response` return
    /// `None`.
    pub fn closer(&self) -> io::Result<StreamCloser> {
        Ok(StreamCloser(self.writer.try_clone()?))
    }
}

#[derive(Debug)]
pub struct StreamCloser(TcpStream);

impl StreamCloser {
    pub fn close(&self) {
        if let Err(e) = self.0.shutdown(NetShutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                warn!(error = %e, "closing control plane stream");
            }
        }
    }
}

impl<R: BufRead, W: Write> UpdateTransport for LineTransport<R, W> {
    fn subscribe(&mut self, request: &WatchRequest) -> Result<(), SyncError> {
        serde_json::to_writer(&mut self.writer, request)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn next_response(&mut self) -> Result<Option<WatchResponse>, SyncError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(line)?));
        }
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub responses: u64,
    pub accepted: u64,
    pub stale: u64,
    pub mirror_failures: u64,
    /// Messages skipped because they did not decode.
    pub undecodable: u64,
}

/// Sole writer of the policy store.
pub struct SyncClient<T, M> {
    transport: T,
    store: Arc<PolicyStore>,
    mirror: M,
    request: WatchRequest,
    last_seen: HashMap<PolicyKey, u64>,
    stats: SyncStats,
}

impl<T: UpdateTransport, M: MapMirror> SyncClient<T, M> {
    pub fn new(
        transport: T,
        store: Arc<PolicyStore>,
        mirror: M,
        request: WatchRequest,
    ) -> SyncClient<T, M> {
        SyncClient {
            transport,
            store,
            mirror,
            request,
            last_seen: HashMap::new(),
            stats: SyncStats::default(),
        }
    }

    /// Subscribe and apply updates until the stream closes. A message that does not decode is
    /// skipped and counted; transport failures end the run.
    pub fn run(&mut self) -> Result<SyncStats, SyncError> {
        self.transport.subscribe(&self.request)?;
        info!(
            group = %self.request.group,
            tables = ?self.request.tables,
            "subscribed to control plane"
        );

        loop {
            let response = match self.transport.next_response() {
                Ok(Some(response)) => response,
                Ok(None) => break,
                Err(SyncError::Decode(e)) => {
                    self.stats.undecodable += 1;
                    warn!(error = %e, "skipping undecodable control plane message");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "control plane stream failed, policy state is frozen");
                    return Err(e);
                }
            };
            self.stats.responses += 1;
            for update in response.updates {
                self.handle(update);
            }
        }

        info!(
            accepted = self.stats.accepted,
            stale = self.stats.stale,
            mirror_failures = self.stats.mirror_failures,
            undecodable = self.stats.undecodable,
            "control plane stream closed"
        );
        Ok(self.stats)
    }

    /// Apply one update. Accepted updates are mirrored to the kernel maps.
    pub fn handle(&mut self, update: Update) -> Applied {
        let Update {
            key,
            version,
            payload,
        } = update;

        let seen = self.last_seen.entry(key.clone()).or_insert(0);
        *seen = (*seen).max(version);

        let value = Arc::new(payload);
        let applied = self.store.apply_shared(key.clone(), version, value.clone());
        match applied {
            Applied::Accepted => {
                self.stats.accepted += 1;
                debug!(%key, version, "accepted");
                if let Err(e) = self.mirror.mirror(&key, &value) {
                    self.stats.mirror_failures += 1;
                    warn!(%key, version, error = %e, "kernel map not updated");
                }
            }
            Applied::Stale => {
                self.stats.stale += 1;
                debug!(%key, version, "stale update ignored");
            }
        }

        applied
    }

    /// Highest version delivered for `key`, accepted or not.
    pub fn last_seen(&self, key: &PolicyKey) -> Option<u64> {
        self.last_seen.get(key).copied()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn mirror(&self) -> &M {
        &self.mirror
    }
}
