//! Composition root.
//!
//! Owns every service — FSM table, session registry, port pool,
//! registrar — and the listener threads: the RTSP accept loop, the
//! URTSP control channel, and the idle sweeper. Nothing in the crate
//! reaches for globals; each thread gets its own handle.

use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::config::ServerConfig;
use crate::congestion::{FrameScaler, NullScaler};
use crate::error::{CastError, Result};
use crate::fsm::Fsm;
use crate::register::{Registrar, control_loop};
use crate::session::{PortPool, SessionRegistry};
use crate::sweep::sweep_loop;
use crate::transport::{UdpTransport, tcp};

/// High-level server orchestrator.
///
/// Delegates RTSP connection handling to [`tcp::accept_loop`], unit
/// registration to [`control_loop`], and RTP delivery to the pacing
/// engines started by PLAY.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    registrar: Arc<Registrar>,
    scaler: Arc<dyn FrameScaler>,
    udp: Option<Arc<UdpTransport>>,
    running: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let fsm = Arc::new(Fsm::new());
        let ports = Arc::new(PortPool::new(config.port_base, config.port_pairs));
        let registry = SessionRegistry::new(fsm, ports);
        let registrar = Arc::new(Registrar::new(
            registry.clone(),
            &config.realm,
            &config.secret,
        ));
        Self {
            config: Arc::new(config),
            registry,
            registrar,
            scaler: Arc::new(NullScaler),
            udp: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the congestion frame scaler (the default is a
    /// passthrough; a real deployment plugs the encoder's recompressor
    /// in here).
    pub fn with_scaler(mut self, scaler: Arc<dyn FrameScaler>) -> Self {
        self.scaler = scaler;
        self
    }

    /// Bind all listeners and spawn the server threads.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CastError::AlreadyRunning);
        }

        let udp = Arc::new(UdpTransport::bind()?);
        self.udp = Some(udp.clone());

        let listener = TcpListener::bind(&self.config.rtsp_bind)?;
        listener.set_nonblocking(true)?;

        let control = UdpSocket::bind(&self.config.control_bind)?;

        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            rtsp = %self.config.rtsp_bind,
            control = %self.config.control_bind,
            media_root = %self.config.media_root.display(),
            "server listening"
        );

        {
            let registry = self.registry.clone();
            let config = self.config.clone();
            let scaler = self.scaler.clone();
            let running = self.running.clone();
            thread::spawn(move || {
                tcp::accept_loop(listener, registry, config, udp, scaler, running);
            });
        }

        {
            let registrar = self.registrar.clone();
            let running = self.running.clone();
            thread::spawn(move || {
                control_loop(control, registrar, running);
            });
        }

        {
            let registry = self.registry.clone();
            let idle_limit = self.config.idle_limit;
            let interval = self.config.sweep_interval;
            let running = self.running.clone();
            thread::spawn(move || {
                sweep_loop(registry, idle_limit, interval, running);
            });
        }

        Ok(())
    }

    /// Stop the listener threads and close every session, stopping all
    /// pacing engines.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.registry.close_all();
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The session registry (exposed for tests and embedders).
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}
