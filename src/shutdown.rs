//! Process-wide shutdown signaling.
//!
//! The first interrupt requests a graceful teardown; the third forces it.
//! Components that block (readiness waits, host-process supervision, event
//! subscriptions) consume the appropriate token. The tokens carry no
//! payload and are used for nothing but shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Number of interrupts after which teardown stops being polite
const FORCE_SIGNAL_COUNT: u32 = 3;

/// The pair of cancellation tokens every long-running task observes
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    graceful: CancellationToken,
    force: CancellationToken,
}

impl Shutdown {
    /// Create an inert pair, not wired to any signal source
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pair and spawn the interrupt listener: first Ctrl-C
    /// cancels the graceful token, the third cancels the force token.
    pub fn install() -> Self {
        let shutdown = Self::new();
        let graceful = shutdown.graceful.clone();
        let force = shutdown.force.clone();
        tokio::spawn(async move {
            let mut received = 0u32;
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                received += 1;
                match received {
                    1 => {
                        info!("interrupt received, shutting down gracefully (press twice more to force)");
                        graceful.cancel();
                    }
                    n if n >= FORCE_SIGNAL_COUNT => {
                        warn!("forcing shutdown");
                        force.cancel();
                        return;
                    }
                    _ => {}
                }
            }
        });
        shutdown
    }

    /// Token cancelled on the first interrupt
    pub fn graceful(&self) -> &CancellationToken {
        &self.graceful
    }

    /// Token cancelled on the third interrupt
    pub fn force(&self) -> &CancellationToken {
        &self.force
    }

    /// Request a graceful shutdown programmatically
    pub fn request(&self) {
        self.graceful.cancel();
    }

    /// Whether a graceful shutdown has been requested
    pub fn is_requested(&self) -> bool {
        self.graceful.is_cancelled()
    }
}
