//! Connection acceptor.
//!
//! Binds the listening endpoint and hands one connection at a time to a
//! [`Session`] running on a worker thread. The [`DatasetWriter`] moves into
//! that worker for the length of the session and comes back when it ends, so
//! there is never more than one writer of the log.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{BusyPolicy, IngestdConfig};
use crate::dataset::DatasetWriter;
use crate::error::IngestError;
use crate::preview::PreviewTap;
use crate::session::{Session, SessionReport};

const ACCEPT_POLL: Duration = Duration::from_millis(20);

type ActiveStream = Arc<Mutex<Option<TcpStream>>>;
type WorkerResult = (DatasetWriter, Option<PreviewTap>, SessionReport);

/// Totals over the server's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerSummary {
    pub sessions: u64,
    pub failed_sessions: u64,
    pub rejected_connections: u64,
    pub frames_committed: u64,
}

pub struct IngestServer {
    cfg: IngestdConfig,
    preview: Option<PreviewTap>,
}

impl IngestServer {
    pub fn new(cfg: IngestdConfig) -> Self {
        Self { cfg, preview: None }
    }

    pub fn with_preview(mut self, preview: PreviewTap) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Prepare the dataset, bind, and start accepting on a background thread.
    ///
    /// Directory and bind failures are returned here, before any connection
    /// is accepted.
    pub fn spawn(self) -> Result<ServerHandle> {
        let writer = DatasetWriter::open(&self.cfg.image_dir, &self.cfg.log_path)
            .context("prepare dataset output")?
            .with_session_subdirs(self.cfg.session_subdirs);

        let listener =
            TcpListener::bind(self.cfg.listen_addr.as_str()).map_err(|source| IngestError::Bind {
                addr: self.cfg.listen_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("ingest server listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let active: ActiveStream = Arc::new(Mutex::new(None));
        let (report_tx, report_rx) = mpsc::channel();

        let acceptor = Acceptor {
            listener,
            cfg: self.cfg,
            shutdown: shutdown.clone(),
            active: active.clone(),
            reports: report_tx,
            summary: ServerSummary::default(),
        };
        let preview = self.preview;
        let join = std::thread::Builder::new()
            .name("ingest-acceptor".to_string())
            .spawn(move || acceptor.run(writer, preview))
            .context("spawn acceptor thread")?;

        Ok(ServerHandle {
            addr,
            shutdown,
            active,
            reports: report_rx,
            join: Some(join),
        })
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: ActiveStream,
    reports: Receiver<SessionReport>,
    join: Option<JoinHandle<Result<ServerSummary>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait up to `timeout` for the next finished session.
    pub fn next_report(&self, timeout: Duration) -> Option<SessionReport> {
        self.reports.recv_timeout(timeout).ok()
    }

    /// True once the acceptor has stopped on its own (session cap reached, a
    /// listener error, or a control log that could not be rolled back).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Close the listener and the active connection. A frame that was in
    /// flight is discarded; committed frames are already durable.
    pub fn stop(mut self) -> Result<ServerSummary> {
        self.shutdown.store(true, Ordering::SeqCst);
        shutdown_active(&self.active);
        self.join_acceptor()
    }

    /// Block until the acceptor stops by itself.
    pub fn wait(mut self) -> Result<ServerSummary> {
        self.join_acceptor()
    }

    fn join_acceptor(&mut self) -> Result<ServerSummary> {
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("ingest server already stopped"))?;
        join.join()
            .map_err(|_| anyhow!("ingest acceptor thread panicked"))?
    }
}

struct Acceptor {
    listener: TcpListener,
    cfg: IngestdConfig,
    shutdown: Arc<AtomicBool>,
    active: ActiveStream,
    reports: Sender<SessionReport>,
    summary: ServerSummary,
}

impl Acceptor {
    fn run(mut self, writer: DatasetWriter, preview: Option<PreviewTap>) -> Result<ServerSummary> {
        let mut idle = Some((writer, preview));
        let mut worker: Option<JoinHandle<WorkerResult>> = None;

        loop {
            if worker.as_ref().is_some_and(|w| w.is_finished()) {
                if let Some(done) = worker.take() {
                    idle = Some(self.finish_session(done)?);
                }
                if self
                    .cfg
                    .max_sessions
                    .is_some_and(|max| self.summary.sessions >= max)
                {
                    log::info!("session limit reached; acceptor stopping");
                    break;
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let busy = worker.is_some();
            if busy && self.cfg.busy_policy == BusyPolicy::Queue {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if busy {
                        reject(stream, peer);
                        self.summary.rejected_connections += 1;
                        continue;
                    }
                    let control = match prepare_stream(&stream, self.cfg.read_timeout) {
                        Ok(control) => control,
                        Err(err) => {
                            log::warn!("connection from {} dropped: {}", peer, err);
                            continue;
                        }
                    };
                    let Some((writer, preview)) = idle.take() else {
                        return Err(anyhow!("dataset writer unavailable while idle"));
                    };
                    worker = Some(self.start_session(stream, control, peer, writer, preview)?);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                    ) =>
                {
                    log::warn!("accept interrupted: {}", err);
                }
                Err(err) => return Err(err).context("accept connection"),
            }
        }

        if let Some(running) = worker.take() {
            shutdown_active(&self.active);
            self.finish_session(running)?;
        }
        log::info!(
            "ingest server stopped: sessions={} failed={} rejected={} frames={}",
            self.summary.sessions,
            self.summary.failed_sessions,
            self.summary.rejected_connections,
            self.summary.frames_committed
        );
        Ok(self.summary)
    }

    fn start_session(
        &mut self,
        stream: TcpStream,
        control: TcpStream,
        peer: SocketAddr,
        mut writer: DatasetWriter,
        preview: Option<PreviewTap>,
    ) -> Result<JoinHandle<WorkerResult>> {
        if let Ok(mut active) = self.active.lock() {
            *active = Some(control);
        }

        self.summary.sessions += 1;
        let number = self.summary.sessions;
        let limits = self.cfg.limits;
        std::thread::Builder::new()
            .name(format!("ingest-session-{}", number))
            .spawn(move || {
                let mut session =
                    Session::new(number, peer.to_string(), limits).with_preview(preview);
                let report = session.run(stream, &mut writer);
                (writer, session.take_preview(), report)
            })
            .context("spawn session thread")
    }

    fn finish_session(
        &mut self,
        handle: JoinHandle<WorkerResult>,
    ) -> Result<(DatasetWriter, Option<PreviewTap>)> {
        let (writer, preview, report) = handle
            .join()
            .map_err(|_| anyhow!("session worker panicked; dataset writer lost"))?;
        if let Ok(mut active) = self.active.lock() {
            *active = None;
        }
        self.summary.frames_committed += report.frames_committed;
        if !report.outcome.is_clean() {
            self.summary.failed_sessions += 1;
        }
        log::debug!(
            "session {} done; {} row(s) appended since startup",
            report.session,
            writer.rows_appended()
        );
        let _ = self.reports.send(report);
        if writer.is_poisoned() {
            return Err(anyhow!(
                "control log {} may hold a row without images; refusing further sessions",
                writer.log_path().display()
            ));
        }
        Ok((writer, preview))
    }
}

/// Switch an accepted stream to blocking reads with the configured timeout
/// and return a second handle used to close it on shutdown.
fn prepare_stream(stream: &TcpStream, read_timeout: Option<Duration>) -> std::io::Result<TcpStream> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(read_timeout)?;
    stream.try_clone()
}

fn reject(stream: TcpStream, peer: SocketAddr) {
    log::warn!(
        "rejecting connection from {}: a session is already active",
        peer
    );
    if let Err(err) = stream.shutdown(Shutdown::Both) {
        log::debug!("shutdown of rejected connection {} failed: {}", peer, err);
    }
}

fn shutdown_active(active: &ActiveStream) {
    let stream = match active.lock() {
        Ok(mut guard) => guard.take(),
        Err(_) => return,
    };
    if let Some(stream) = stream {
        if let Err(err) = stream.shutdown(Shutdown::Both) {
            log::debug!("shutdown of active connection failed: {}", err);
        }
    }
}
