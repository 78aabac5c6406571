//! Transport endpoints and their bring-up.
//!
//! Concrete wire transports (TCP, message queues, shared memory) are
//! external; the core consumes the [`Endpoint`] interface and ships
//! only the in-process loopback variant. Endpoint creation retries to
//! ride out peer start-up races, watching the stop flag so a shutdown
//! request during bring-up aborts as cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Uid;

/// UID assigned by the loopback endpoint when the caller leaves it to
/// the bus.
const LOOPBACK_UID: Uid = 42;

/// A transport endpoint, as consumed by the adapter.
pub trait Endpoint: Send + std::fmt::Debug {
    /// The bus-assigned endpoint UID.
    fn uid(&self) -> Uid;

    fn kind(&self) -> &str;

    /// Creates transport resources. Called once before connecting.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Interrupts any blocking transport wait. Called from the
    /// shutdown path; must not allocate or block.
    fn interrupt(&self) {}

    fn disconnect(&mut self) {}
}

/// In-process endpoint with no wire behind it.
#[derive(Debug)]
pub struct LoopbackEndpoint {
    uid: Uid,
    interrupted: Arc<AtomicBool>,
}

impl LoopbackEndpoint {
    pub fn new(uid: Uid, interrupted: Arc<AtomicBool>) -> Self {
        let uid = if uid == 0 { LOOPBACK_UID } else { uid };
        Self { uid, interrupted }
    }

    pub fn with_uid(uid: Uid) -> Self {
        Self::new(uid, Arc::new(AtomicBool::new(false)))
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl Endpoint for LoopbackEndpoint {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn kind(&self) -> &str {
        "loopback"
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

/// Retry policy for endpoint bring-up.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            delay: Duration::from_secs(1),
        }
    }
}

fn endpoint_create(
    transport: &str,
    uri: &str,
    uid: Uid,
    interrupted: &Arc<AtomicBool>,
) -> Result<Box<dyn Endpoint>> {
    match transport {
        "loopback" => Ok(Box::new(LoopbackEndpoint::new(uid, Arc::clone(interrupted)))),
        other => Err(Error::Config(format!(
            "transport {other} not available ({uri})"
        ))),
    }
}

/// Creates the endpoint, retrying failed attempts.
///
/// A stop request observed during the retry loop aborts with
/// [`Error::Cancelled`]; misconfigured endpoints are the usual cause
/// of getting stuck here.
pub fn create_endpoint(
    transport: &str,
    uri: &str,
    uid: Uid,
    policy: RetryPolicy,
    stop: &AtomicBool,
    interrupted: &Arc<AtomicBool>,
) -> Result<Box<dyn Endpoint>> {
    let mut last = Error::Config("endpoint creation never attempted".to_string());
    for attempt in 0..policy.attempts.max(1) {
        match endpoint_create(transport, uri, uid, interrupted) {
            Ok(endpoint) => return Ok(endpoint),
            Err(err) => last = err,
        }
        if stop.load(Ordering::SeqCst) {
            tracing::error!("stop requested during endpoint creation");
            return Err(Error::Cancelled);
        }
        if attempt + 1 < policy.attempts {
            std::thread::sleep(policy.delay);
            tracing::info!(transport, uri, "retry endpoint creation ...");
        }
    }
    Err(last)
}
