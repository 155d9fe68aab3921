//! Sends that have left the store but not yet completed.
//!
//! Each send runs as its own task and reports back only its ticket; the hit
//! itself stays here until the outcome is known, so a failed, panicked or
//! aborted send can always be put back.

use crate::hit::{build_post_payload, build_post_url, Hit};
use crate::transport::Transport;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

type Ticket = u64;

/// Outcome of one completed send task
pub(crate) enum Settled {
    Delivered(Hit),
    Failed(Hit, anyhow::Error),
    /// The task panicked or was aborted; its hit stays tracked as an orphan
    Lost(JoinError),
}

pub(crate) struct InFlight {
    tasks: JoinSet<(Ticket, Result<()>)>,
    hits: BTreeMap<Ticket, Hit>,
    next_ticket: Ticket,
    permits: Arc<Semaphore>,
}

impl InFlight {
    /// `max_concurrent` bounds requests running at once; further sends wait
    /// for a permit.
    pub fn new(max_concurrent: usize) -> Self {
        InFlight {
            tasks: JoinSet::new(),
            hits: BTreeMap::new(),
            next_ticket: 0,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Start sending `hit`. Must be called from within a tokio runtime.
    pub fn submit(&mut self, hit: Hit, transport: &Arc<dyn Transport>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let path = build_post_url(&hit);
        let body = build_post_payload(&hit);
        self.hits.insert(ticket, hit);

        let transport = Arc::clone(transport);
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (ticket, transport.post(&path, body).await)
        });
    }

    /// Next finished send, or `None` when no task is running
    pub async fn join_next(&mut self) -> Option<Result<(Ticket, Result<()>), JoinError>> {
        self.tasks.join_next().await
    }

    pub fn settle(&mut self, joined: Result<(Ticket, Result<()>), JoinError>) -> Option<Settled> {
        match joined {
            Ok((ticket, outcome)) => {
                let hit = self.hits.remove(&ticket)?;
                Some(match outcome {
                    Ok(()) => Settled::Delivered(hit),
                    Err(e) => Settled::Failed(hit, e),
                })
            }
            Err(e) => Some(Settled::Lost(e)),
        }
    }

    /// Hits whose task is gone without reporting. Only meaningful once no
    /// task is running.
    pub fn take_orphans(&mut self) -> Vec<Hit> {
        if !self.tasks.is_empty() {
            return Vec::new();
        }
        std::mem::take(&mut self.hits).into_values().collect()
    }

    /// Abort every running send and hand back all tracked hits in
    /// submission order.
    pub fn abort_all(&mut self) -> Vec<Hit> {
        self.tasks.abort_all();
        self.tasks.detach_all();
        std::mem::take(&mut self.hits).into_values().collect()
    }
}
