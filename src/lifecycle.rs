//! Startup sequencing and transport serving
//!
//! # Handshake
//!
//! 1. Wait for the engine-ready marker file (if configured).
//! 2. Start the engine session.
//! 3. Touch the runner-ready marker; the host may snapshot the VM from here.
//! 4. On every connection, write one `ready` line before anything else.
//!
//! A bare newline from the host at any point is a liveness probe and gets
//! no reply.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{FrameReader, ResponseWriter};
use crate::config::DaemonConfig;
use crate::dispatcher::{Dispatcher, Flow, ServerIdentity};
use crate::error::{Result, RunnerError};
use crate::session::{BridgeSession, Session, SharedSession};

/// What to do with the session when a connection reaches end of stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofPolicy {
    /// Stop everything, as if `shutdown` had been sent (stdio)
    CloseSession,
    /// Drop the subscription and wait for the next client (TCP)
    KeepSession,
}

/// Block until `path` exists, polling every `poll`
pub fn wait_for_marker(path: &Path, timeout: Duration, poll: Duration) -> Result<()> {
    let started = Instant::now();
    tracing::info!("Waiting for engine ready marker {}", path.display());
    loop {
        if path.exists() {
            tracing::info!(
                "Engine ready after {}ms",
                started.elapsed().as_millis()
            );
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(RunnerError::StartupTimeout {
                path: path.display().to_string(),
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });
        }
        thread::sleep(poll);
    }
}

/// Create (or truncate) an empty marker file
pub fn touch_marker(path: &Path) -> Result<()> {
    File::create(path)?;
    tracing::info!("Wrote runner ready marker {}", path.display());
    Ok(())
}

/// Serve one client until it sends `shutdown` or closes its end
pub fn serve_connection<R: BufRead>(
    reader: R,
    writer: ResponseWriter,
    session: &SharedSession,
    identity: &ServerIdentity,
    config: &DaemonConfig,
    on_eof: EofPolicy,
) -> Result<Flow> {
    writer.send(&identity.ready())?;

    let mut dispatcher = Dispatcher::new(session.clone(), writer, identity.clone(), config);
    let mut frames = FrameReader::new(reader);
    loop {
        let frame = match frames.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Read error, treating as end of stream: {}", e);
                break;
            }
        };
        if dispatcher.handle_frame(frame) == Flow::Shutdown {
            return Ok(Flow::Shutdown);
        }
    }

    tracing::info!("Client disconnected");
    match on_eof {
        EofPolicy::CloseSession => dispatcher.finish(),
        EofPolicy::KeepSession => {
            dispatcher.subscriptions().cancel();
        }
    }
    Ok(Flow::Continue)
}

/// Run the full lifecycle with the bridge-backed session
pub fn run(config: &DaemonConfig) -> Result<()> {
    if let Some(marker) = config.engine_ready_marker() {
        wait_for_marker(&marker, config.ready_timeout(), config.marker_poll())?;
    }

    let bridge = BridgeSession::spawn(
        &config.engine.command,
        config.mode,
        &config.host,
        config.port,
    )?;
    let identity = ServerIdentity::new(config, bridge.port(), bridge.version());
    let session = SharedSession::new(bridge);

    if let Some(marker) = config.runner_ready_marker() {
        touch_marker(&marker)?;
    }

    serve(&session, &identity, config)
}

/// Serve stdio, or TCP when `listen` is configured
pub fn serve(session: &SharedSession, identity: &ServerIdentity, config: &DaemonConfig) -> Result<()> {
    match &config.listen {
        None => {
            tracing::info!("Serving on stdio (mode {})", identity.mode);
            let stdin = std::io::stdin();
            serve_connection(
                stdin.lock(),
                ResponseWriter::stdout(),
                session,
                identity,
                config,
                EofPolicy::CloseSession,
            )?;
            Ok(())
        }
        Some(addr) => serve_tcp(addr, session, identity, config),
    }
}

fn serve_tcp(
    addr: &str,
    session: &SharedSession,
    identity: &ServerIdentity,
    config: &DaemonConfig,
) -> Result<()> {
    let listener = TcpListener::bind(addr)?;
    tracing::info!("Listening on {} (mode {})", listener.local_addr()?, identity.mode);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!("Client connected from {}", peer);

        let reader = BufReader::new(stream.try_clone()?);
        let flow = serve_connection(
            reader,
            ResponseWriter::new(stream),
            session,
            identity,
            config,
            EofPolicy::KeepSession,
        );
        match flow {
            Ok(Flow::Shutdown) => return Ok(()),
            Ok(Flow::Continue) => {}
            Err(e) => tracing::warn!("Connection from {} ended with error: {}", peer, e),
        }
    }
    Ok(())
}
