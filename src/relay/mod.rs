//! WebSocket push relay.
//!
//! Clients connect with a WebSocket handshake. Every published buffer is sent
//! to every client as one binary message, with no further framing. Clients
//! that fail a send are dropped. Nothing the client sends is read.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tungstenite::{Message, WebSocket};

use crate::ingest::{SourceEvent, StreamSource};
use crate::join_unless_current;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub addr: String,
}

impl RelayConfig {
    pub fn new(bind: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", bind, port),
        }
    }
}

/// Cloneable handle used to push bytes to all relay clients.
#[derive(Clone, Default)]
pub struct RelayPublisher {
    clients: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
}

impl RelayPublisher {
    /// Send `bytes` to every client as a binary message. Returns how many
    /// clients received them.
    pub fn publish(&self, bytes: &[u8]) -> usize {
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients.retain_mut(|client| match client.send(Message::binary(bytes.to_vec())) {
            Ok(()) => true,
            Err(e) => {
                log::info!(
                    "relay client {} dropped: {}",
                    client
                        .get_ref()
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "?".to_string()),
                    e
                );
                false
            }
        });
        clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn add(&self, client: WebSocket<TcpStream>) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.push(client);
        }
    }

    fn clear(&self) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.clear();
        }
    }
}

pub struct RelayServer {
    cfg: RelayConfig,
}

#[derive(Debug)]
pub struct RelayHandle {
    pub addr: SocketAddr,
    publisher: RelayPublisher,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RelayPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPublisher")
            .field("clients", &self.client_count())
            .finish()
    }
}

impl RelayServer {
    pub fn new(cfg: RelayConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn(self) -> Result<RelayHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("bind relay on {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let publisher = RelayPublisher::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let accept_publisher = publisher.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_accept(listener, accept_publisher, shutdown_thread) {
                log::error!("relay on {} stopped: {}", addr, err);
            }
        });
        log::info!("relay listening on {}", addr);

        Ok(RelayHandle {
            addr,
            publisher,
            shutdown,
            join: Some(join),
        })
    }
}

impl RelayHandle {
    pub fn publisher(&self) -> RelayPublisher {
        self.publisher.clone()
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown_now()
    }

    fn shutdown_now(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.publisher.clear();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("relay accept thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_now() {
            log::warn!("relay shutdown: {}", err);
        }
    }
}

fn run_accept(
    listener: TcpListener,
    publisher: RelayPublisher,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
                let publisher = publisher.clone();
                let shutdown = shutdown.clone();
                std::thread::spawn(move || match tungstenite::accept(stream) {
                    Ok(socket) if !shutdown.load(Ordering::SeqCst) => {
                        log::info!("relay client {} connected", peer);
                        publisher.add(socket);
                    }
                    Ok(_) => {}
                    Err(err) => log::info!("relay client {} rejected: {}", peer, err),
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Forwards everything a source produces to a relay.
pub struct SourceRelay {
    source: Box<dyn StreamSource>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SourceRelay {
    pub fn start(mut source: Box<dyn StreamSource>, publisher: RelayPublisher) -> Result<Self> {
        let rx = source.open()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let info = source.describe();
        let join = std::thread::spawn(move || loop {
            if shutdown_thread.load(Ordering::SeqCst) {
                break;
            }
            match rx.recv_timeout(ACCEPT_POLL) {
                Ok(SourceEvent::Data(chunk)) => {
                    publisher.publish(&chunk);
                }
                Ok(SourceEvent::ExitWithError(message)) => {
                    log::error!("relay source {} exited with error: {}", info.kind, message);
                    break;
                }
                Ok(SourceEvent::Closed) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => continue,
            }
        });
        Ok(Self {
            source,
            shutdown,
            join: Some(join),
        })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.source.close();
        join_unless_current(self.join.take());
    }
}

impl Drop for SourceRelay {
    fn drop(&mut self) {
        self.stop();
    }
}
