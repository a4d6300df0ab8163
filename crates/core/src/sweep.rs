//! Idle-session eviction and health telemetry.
//!
//! A periodic pass over a registry snapshot — never the live map —
//! that force-closes sessions whose age reached the idle limit,
//! whatever state they are in, and emits a health line. Runs on its
//! own thread, independent of playback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::fsm::SessionState;
use crate::session::SessionRegistry;

/// Poll granularity between `running` checks; bounds shutdown latency
/// without tying it to the sweep interval.
const TICK: Duration = Duration::from_millis(250);

/// Sweep loop body. Spawned by the server on its own thread.
pub fn sweep_loop(
    registry: SessionRegistry,
    idle_limit: Duration,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    let mut since_sweep = Duration::ZERO;
    while running.load(Ordering::SeqCst) {
        thread::sleep(TICK.min(interval));
        since_sweep += TICK.min(interval);
        if since_sweep < interval {
            continue;
        }
        since_sweep = Duration::ZERO;
        sweep_once(&registry, idle_limit);
    }
    tracing::debug!("sweeper exited");
}

/// One pass: snapshot, evict, report.
pub fn sweep_once(registry: &SessionRegistry, idle_limit: Duration) {
    let sessions = registry.snapshot();
    let mut playing = 0usize;
    let mut evicted = 0usize;

    for session in &sessions {
        if session.state() == SessionState::Play {
            playing += 1;
        }
        if session.age() >= idle_limit {
            tracing::info!(
                unit = %session.unit_id,
                age_secs = session.age().as_secs(),
                state = ?session.state(),
                "idle session evicted"
            );
            registry.close(&session.unit_id);
            evicted += 1;
        }
    }

    tracing::info!(
        total = sessions.len(),
        playing,
        evicted,
        ports_free = registry.ports().available(),
        "session sweep"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{Fsm, SessionEvent};
    use crate::session::PortPool;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(Fsm::new()), Arc::new(PortPool::new(5000, 4)))
    }

    #[test]
    fn evicts_only_sessions_past_the_limit() {
        let registry = registry();
        registry.open("unit-old");
        thread::sleep(Duration::from_millis(30));
        registry.open("unit-new");

        sweep_once(&registry, Duration::from_millis(25));
        assert!(registry.get("unit-old").is_none(), "old session evicted");
        assert!(registry.get("unit-new").is_some(), "young session kept");
    }

    #[test]
    fn eviction_ignores_state() {
        let registry = registry();
        let session = registry.open("unit-1");
        session.fire(SessionEvent::Register).unwrap();
        session.fire(SessionEvent::Options).unwrap();
        session.fire(SessionEvent::Setup).unwrap();
        session.fire(SessionEvent::Play).unwrap();

        sweep_once(&registry, Duration::ZERO);
        assert!(registry.get("unit-1").is_none(), "playing session evicted too");
    }

    #[test]
    fn eviction_releases_port() {
        let registry = registry();
        let session = registry.open("unit-1");
        let port = registry.ports().allocate().unwrap();
        assert!(session.assign_rtp_port(port));

        sweep_once(&registry, Duration::ZERO);
        assert_eq!(registry.ports().available(), 4);
    }
}
