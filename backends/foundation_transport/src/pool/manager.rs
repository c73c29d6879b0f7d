//! Supervised pool coordinator.
//!
//! WHY: Registering, parking, releasing and reaping connections are
//! structural decisions that must not race each other, while connecting and
//! all request IO should stay in the caller's thread.
//!
//! WHAT: [`PoolManager`] runs a coordinator thread fed by a command mailbox
//! with request/reply. A supervisor thread owns the mailbox and restarts the
//! coordinator if it panics. The [`PoolRegistry`] lives outside both threads,
//! so pooled connections survive a restart. Checkout looks up the registry
//! directly and connects in the calling thread on a miss.

use super::registry::{CheckinOutcome, PoolRegistry, RegistryStats};
use super::PoolKey;
use crate::config::{self, PoolSettings, TransportConfig};
use crate::connection::{ConnectOptions, Connection};
use crate::errors::{ClientError, ClientResult, TransportError};
use crate::mailbox::{self, Receiver, ReceiverError, Sender};
use crate::transport;
use crate::types::ConnectionWatch;
use crate::url;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest a caller waits for the coordinator to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

static GLOBAL_POOL: OnceLock<PoolManager> = OnceLock::new();

enum Command {
    Register {
        key: PoolKey,
        watch: ConnectionWatch,
        reply: Sender<()>,
    },
    Checkin {
        connection: Connection,
        reply: Sender<()>,
    },
    Release {
        connection: Connection,
        reply: Sender<()>,
    },
    Reap {
        reply: Sender<usize>,
    },
    Shutdown {
        reply: Sender<()>,
    },
    #[cfg(test)]
    Crash,
}

/// Process-wide connection pool.
pub struct PoolManager {
    commands: Sender<Command>,
    registry: Arc<PoolRegistry>,
    options: ConnectOptions,
    running: Arc<AtomicBool>,
    restarts: Arc<AtomicU32>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("running", &self.is_running())
            .field("restarts", &self.restarts())
            .field("registry", &self.registry)
            .finish()
    }
}

impl PoolManager {
    /// Starts a pool with the default connect options.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] when the supervisor thread cannot be
    /// spawned.
    pub fn start(config: &TransportConfig) -> ClientResult<Self> {
        let options = ConnectOptions {
            connect_timeout: config.connect_timeout(),
            ..ConnectOptions::default()
        };
        Self::start_with(config, options)
    }

    /// Starts a pool whose connections are opened with `options`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] when the supervisor thread cannot be
    /// spawned.
    pub fn start_with(config: &TransportConfig, options: ConnectOptions) -> ClientResult<Self> {
        let settings = config.pool.clone();
        let registry = Arc::new(PoolRegistry::new(
            settings.registry_shards,
            settings.max_idle_per_key,
        ));
        let (commands, receiver) = mailbox::mailbox();
        let running = Arc::new(AtomicBool::new(true));
        let restarts = Arc::new(AtomicU32::new(0));

        let supervisor = Supervisor {
            receiver,
            registry: registry.clone(),
            settings,
            running: running.clone(),
            restarts: restarts.clone(),
        };
        let handle = thread::Builder::new()
            .name("transport-pool-supervisor".into())
            .spawn(move || supervisor.run())
            .map_err(|err| ClientError::Transport(TransportError::IoError(err)))?;

        info!("connection pool started");
        Ok(Self {
            commands,
            registry,
            options,
            running,
            restarts,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Times the coordinator has been restarted after a panic.
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    #[must_use]
    pub fn stats_for(&self, key: &PoolKey) -> RegistryStats {
        self.registry.stats_for(key)
    }

    fn call<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> ClientResult<T> {
        if !self.is_running() {
            return Err(ClientError::PoolUnavailable);
        }

        let (reply, answer) = mailbox::bounded(1);
        self.commands
            .send(build(reply))
            .map_err(|_| ClientError::PoolUnavailable)?;

        answer.recv_timeout(REPLY_TIMEOUT).map_err(|err| {
            warn!("pool coordinator did not answer: {}", err);
            ClientError::PoolUnavailable
        })
    }

    /// Hands out a connection to the origin of `url`.
    ///
    /// Idle connections are reused most recent first; ones that died while
    /// parked are released and skipped. On a miss the connection is opened in
    /// the calling thread and registered as checked out.
    ///
    /// Return it with [`PoolManager::checkin`] or [`PoolManager::release`].
    /// A handle that is simply dropped closes its socket and is forgotten by
    /// the next reap.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidUrl`], [`ClientError::UnsupportedProtocol`], the
    /// transport error from connecting, or [`ClientError::PoolUnavailable`].
    /// A failed checkout leaves the pool as it was.
    pub fn checkout(&self, url: &str) -> ClientResult<Connection> {
        if !self.is_running() {
            return Err(ClientError::PoolUnavailable);
        }

        let endpoint = url::decompose(url)?;
        let kind = transport::select(&endpoint.protocol)?;
        let key = PoolKey::from(&endpoint);

        while let Some(connection) = self.registry.lookup_idle(&key) {
            if connection.is_reusable() {
                debug!("{} reused for {}", connection.id(), key);
                return Ok(connection);
            }
            debug!("{} died while idle, releasing", connection.id());
            self.release(connection)?;
        }

        let connection = Connection::open(endpoint, kind, &self.options)?;
        let id = connection.id();
        if let Err(err) = self.call(|reply| Command::Register {
            key: key.clone(),
            watch: connection.watch(),
            reply,
        }) {
            connection.close();
            return Err(err);
        }

        debug!("{} opened for {}", id, key);
        Ok(connection)
    }

    /// Returns a connection to the pool. Connections that cannot be reused
    /// are closed instead.
    ///
    /// # Errors
    ///
    /// [`ClientError::PoolUnavailable`] when the coordinator is gone; the
    /// connection is closed in that case.
    pub fn checkin(&self, connection: Connection) -> ClientResult<()> {
        self.call(|reply| Command::Checkin { connection, reply })
    }

    /// Removes a connection from the pool and closes it.
    ///
    /// # Errors
    ///
    /// [`ClientError::PoolUnavailable`] when the coordinator is gone; the
    /// connection is closed in that case.
    pub fn release(&self, connection: Connection) -> ClientResult<()> {
        self.call(|reply| Command::Release { connection, reply })
    }

    /// Reaps stale idle connections now, returning how many were closed.
    ///
    /// # Errors
    ///
    /// [`ClientError::PoolUnavailable`] when the coordinator is gone.
    pub fn reap(&self) -> ClientResult<usize> {
        self.call(|reply| Command::Reap { reply })
    }

    /// Stops the coordinator and closes every idle connection. Checked-out
    /// connections stay with their holders.
    ///
    /// # Errors
    ///
    /// [`ClientError::PoolUnavailable`] when the pool was already stopped.
    pub fn shutdown(&self) -> ClientResult<()> {
        let result = self.call(|reply| Command::Shutdown { reply });

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        info!("connection pool stopped");
        result
    }

    #[cfg(test)]
    fn crash(&self) {
        let _ = self.commands.send(Command::Crash);
    }
}

/// The process-wide pool, started from [`config::global`] on first use.
///
/// # Errors
///
/// [`ClientError::Transport`] when the pool threads cannot be spawned.
pub fn global() -> ClientResult<&'static PoolManager> {
    if let Some(manager) = GLOBAL_POOL.get() {
        return Ok(manager);
    }
    let manager = PoolManager::start(config::global())?;
    Ok(GLOBAL_POOL.get_or_init(|| manager))
}

struct Supervisor {
    receiver: Receiver<Command>,
    registry: Arc<PoolRegistry>,
    settings: PoolSettings,
    running: Arc<AtomicBool>,
    restarts: Arc<AtomicU32>,
}

impl Supervisor {
    fn run(self) {
        loop {
            let outcome = thread::scope(|scope| {
                thread::Builder::new()
                    .name("transport-pool-coordinator".into())
                    .spawn_scoped(scope, || {
                        coordinate(&self.receiver, &self.registry, &self.settings);
                    })
                    .map(|handle| handle.join().is_ok())
            });

            match outcome {
                Ok(true) => break,
                Ok(false) => {
                    let restarts = self.restarts.fetch_add(1, Ordering::AcqRel) + 1;
                    if restarts > self.settings.max_restarts {
                        error!(
                            "pool coordinator crashed {} times, giving up",
                            restarts
                        );
                        break;
                    }
                    warn!("pool coordinator crashed, restart {}", restarts);
                }
                Err(err) => {
                    error!("failed to spawn pool coordinator: {}", err);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        self.receiver.close();
        let closed = close_all(self.registry.drain());
        debug!("pool supervisor exited, closed {} idle connections", closed);
    }
}

fn close_all(connections: Vec<Connection>) -> usize {
    let count = connections.len();
    for connection in connections {
        connection.close();
    }
    count
}

fn reap(registry: &PoolRegistry, settings: &PoolSettings) -> usize {
    let reaped = close_all(registry.reap_idle(settings.max_idle_time()));
    if reaped > 0 {
        debug!("reaped {} idle connections", reaped);
    }
    reaped
}

/// Coordinator loop. Returns on shutdown or when every sender is gone.
fn coordinate(receiver: &Receiver<Command>, registry: &PoolRegistry, settings: &PoolSettings) {
    let interval = settings.reap_interval();
    let mut next_reap = Instant::now() + interval;

    loop {
        let wait = next_reap.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(wait) {
            Ok(Command::Register { key, watch, reply }) => {
                registry.register(&key, watch);
                let _ = reply.send(());
            }
            Ok(Command::Checkin { connection, reply }) => {
                match registry.mark_idle(connection) {
                    CheckinOutcome::Parked => {}
                    CheckinOutcome::Evicted(oldest) => {
                        debug!("{} evicted over the idle limit", oldest.id());
                        oldest.close();
                    }
                    CheckinOutcome::Rejected(connection) => {
                        debug!("{} not reusable, closing", connection.id());
                        connection.close();
                    }
                }
                let _ = reply.send(());
            }
            Ok(Command::Release { connection, reply }) => {
                let key = PoolKey::from(connection.endpoint());
                let _ = registry.remove(&key, connection.id());
                connection.close();
                let _ = reply.send(());
            }
            Ok(Command::Reap { reply }) => {
                let _ = reply.send(reap(registry, settings));
                next_reap = Instant::now() + interval;
            }
            Ok(Command::Shutdown { reply }) => {
                close_all(registry.drain());
                let _ = reply.send(());
                return;
            }
            #[cfg(test)]
            Ok(Command::Crash) => panic!("coordinator crash requested"),
            Err(ReceiverError::Timeout | ReceiverError::Empty) => {}
            Err(ReceiverError::Closed) => return,
        }

        if Instant::now() >= next_reap {
            reap(registry, settings);
            next_reap = Instant::now() + interval;
        }
    }
}
