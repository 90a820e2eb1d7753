//! ICE negotiation seam
//!
//! The tunnel only needs one capability from a negotiation engine: start
//! gathering against a TURN server with a username/credential pair and report
//! the candidates it finds. Engines implement [`Gatherer`]; the returned
//! [`CandidateStream`] owns the negotiation and releases it when dropped.

mod candidate;
mod turn;

pub use candidate::{CandidateType, IceCandidate};
pub use turn::TurnGatherer;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Default TURN port when the server address carries none
pub const DEFAULT_TURN_PORT: u16 = 3478;

/// Parameters of one negotiation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherRequest {
    /// TURN server as `host` or `host:port`
    pub server: String,
    pub username: String,
    pub credential: String,
}

/// Progress reported while gathering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatherEvent {
    Candidate(IceCandidate),
    /// Gathering finished; no more candidates follow
    Complete,
}

/// A negotiation engine restricted to relay candidates.
///
/// Implementations must not report host or server-reflexive candidates as
/// `relay`, and must stop all work once the returned stream is dropped.
#[async_trait]
pub trait Gatherer: Send + Sync {
    async fn gather(&self, request: GatherRequest) -> Result<CandidateStream>;
}

/// Candidate events of one running negotiation.
///
/// Holds whatever keeps the negotiation alive (typically the engine task);
/// dropping the stream drops that context on every exit path.
pub struct CandidateStream {
    events: mpsc::Receiver<GatherEvent>,
    _context: Box<dyn Send>,
}

impl CandidateStream {
    /// Wrap an event channel together with the context that feeds it
    pub fn new<C: Send + 'static>(events: mpsc::Receiver<GatherEvent>, context: C) -> Self {
        Self {
            events,
            _context: Box::new(context),
        }
    }

    /// Wrap an event channel fed by a spawned task; the task is aborted on drop
    pub fn spawned(events: mpsc::Receiver<GatherEvent>, task: JoinHandle<()>) -> Self {
        Self::new(events, AbortOnDrop(task))
    }

    /// Next event, or `None` once the engine went away
    pub async fn next(&mut self) -> Option<GatherEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for CandidateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateStream").finish_non_exhaustive()
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
