//! Blocking waits on the progress of a cluster.
//!
//! Every wait polls the running members of a cluster on a fixed tick (the first
//! tick fires one period after the call) until its predicate holds or the
//! supplied [Deadline] fires. Members that are not running are ignored; a member
//! that starts while a wait is in progress is snapshotted when first observed.

use crate::{
    chain::{self, Reader},
    deadline::{Deadline, Expired},
    types::Header,
};
use commonware_macros::select;
use commonware_runtime::{
    signal::{Signal, Signaler},
    Clock, Handle, Spawner,
};
use futures::{stream::FuturesUnordered, StreamExt};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while waiting on a cluster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("canceled")]
    Canceled,
    #[error("no running nodes")]
    NoRunningNodes,
    #[error("node {node}: {source}")]
    Query { node: usize, source: chain::Error },
    #[error("node {node}: unexpected block rate: parent time {parent_time}, time {time}")]
    BlockRate {
        node: usize,
        parent_time: u64,
        time: u64,
    },
}

impl From<Expired> for Error {
    fn from(expired: Expired) -> Self {
        match expired {
            Expired::Timeout => Error::DeadlineExceeded,
            Expired::Canceled => Error::Canceled,
        }
    }
}

/// A node whose chain can be observed.
pub trait Member {
    /// Index of the node within its cluster.
    fn id(&self) -> usize;

    /// A reader over the node's chain, or `None` if the node is not running.
    fn reader(&self) -> Option<Arc<dyn Reader>>;
}

/// Configuration for a [Monitor].
#[derive(Clone, Debug)]
pub struct Config {
    /// Interval between polls.
    pub tick: Duration,

    /// Expected time between consecutive blocks, in header time units (seconds).
    pub block_period: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            block_period: 1,
        }
    }
}

/// Fires every `period`, starting one period after creation.
///
/// A tick that fires late pushes every later tick back.
struct Ticker<E: Clock> {
    context: E,
    period: Duration,
    next: SystemTime,
}

impl<E: Clock> Ticker<E> {
    fn new(context: E, period: Duration) -> Self {
        let next = context.current() + period;
        Self {
            context,
            period,
            next,
        }
    }

    async fn tick(&mut self) {
        self.context.sleep_until(self.next).await;
        self.next = self.next.max(self.context.current()) + self.period;
    }
}

/// Waits on the progress of a set of [Member]s.
#[derive(Clone)]
pub struct Monitor<E: Spawner + Clock> {
    context: E,
    cfg: Config,
}

impl<E: Spawner + Clock> Monitor<E> {
    pub fn new(context: E, cfg: Config) -> Self {
        Self { context, cfg }
    }

    fn ticker(&self) -> Ticker<E> {
        Ticker::new(self.context.clone(), self.cfg.tick)
    }

    /// Block until every running member reports that it has caught up with its peers.
    ///
    /// Each member is polled by its own task. The first failure stops every
    /// poller and is returned.
    pub async fn wait_for_sync_complete<M: Member>(
        &self,
        members: &[M],
        deadline: &Deadline,
    ) -> Result<(), Error> {
        let (signaler, signal) = Signaler::new();
        let mut pollers: FuturesUnordered<Handle<Result<(), Error>>> = FuturesUnordered::new();
        for member in members {
            let Some(reader) = member.reader() else {
                continue;
            };
            let poller = poll_sync(
                member.id(),
                reader,
                self.ticker(),
                deadline.clone(),
                signal.clone(),
            );
            pollers.push(
                self.context
                    .with_label("sync_poller")
                    .spawn(move |_| poller),
            );
        }

        let mut signaler = Some(signaler);
        let mut result = Ok(());
        while let Some(joined) = pollers.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = ?err, "sync poller failed");
                    continue;
                }
            };
            if let Err(err) = outcome {
                if result.is_ok() {
                    debug!(error = ?err, "stopping sync pollers");
                    result = Err(err);
                    if let Some(signaler) = signaler.take() {
                        let _ = signaler.signal(0);
                    }
                }
            }
        }
        result
    }

    /// Block until every running member's height is strictly above the height it
    /// had when first observed.
    pub async fn wait_for_network_to_start_mining<M: Member>(
        &self,
        members: &[M],
        deadline: &Deadline,
    ) -> Result<(), Error> {
        let mut baseline = snapshot(members)?;
        if baseline.is_empty() {
            return Err(Error::NoRunningNodes);
        }
        self.poll(members, deadline, |id, _, header| {
            let base = *baseline.entry(id).or_insert(header.number);
            Ok(header.number > base)
        })
        .await
    }

    /// Block until every running member has advanced by at least `n` blocks.
    ///
    /// If `verify_rate` is set, every single-block advance observed between two
    /// ticks must be exactly one block period after its parent or the wait fails
    /// with [Error::BlockRate]. Advances of more than one block are not checked.
    pub async fn wait_to_mine_n_blocks<M: Member>(
        &self,
        members: &[M],
        n: u64,
        deadline: &Deadline,
        verify_rate: bool,
    ) -> Result<(), Error> {
        let mut baseline = snapshot(members)?;
        if baseline.is_empty() {
            return Ok(());
        }
        let mut last = baseline.clone();
        let period = self.cfg.block_period;
        self.poll(members, deadline, |id, reader, header| {
            let base = *baseline.entry(id).or_insert(header.number);
            let previous = last.insert(id, header.number).unwrap_or(header.number);
            if verify_rate && header.number == previous + 1 {
                let parent = reader
                    .header_by_hash(&header.parent)
                    .and_then(|parent| parent.ok_or(chain::Error::UnknownBlock(header.parent)))
                    .map_err(|source| Error::Query { node: id, source })?;
                if header.time.saturating_sub(parent.time) != period {
                    warn!(
                        node = id,
                        number = header.number,
                        parent_time = parent.time,
                        time = header.time,
                        "unexpected block rate"
                    );
                    return Err(Error::BlockRate {
                        node: id,
                        parent_time: parent.time,
                        time: header.time,
                    });
                }
            }
            Ok(header.number >= base.saturating_add(n))
        })
        .await
    }

    /// Block until every running member is at height `height` or above.
    pub async fn wait_for_height<M: Member>(
        &self,
        members: &[M],
        height: u64,
        deadline: &Deadline,
    ) -> Result<(), Error> {
        if members.iter().all(|member| member.reader().is_none()) {
            return Ok(());
        }
        self.poll(members, deadline, |_, _, header| Ok(header.number >= height))
            .await
    }

    /// Tick until `check` holds for every running member.
    async fn poll<M, F>(&self, members: &[M], deadline: &Deadline, mut check: F) -> Result<(), Error>
    where
        M: Member,
        F: FnMut(usize, &dyn Reader, &Header) -> Result<bool, Error>,
    {
        let mut ticker = self.ticker();
        loop {
            select! {
                _ = ticker.tick() => {},
                expired = deadline.expired(&self.context) => {
                    return Err(expired.into());
                },
            }
            let mut done = true;
            for member in members {
                let Some(reader) = member.reader() else {
                    continue;
                };
                let id = member.id();
                let header = reader
                    .current_header()
                    .map_err(|source| Error::Query { node: id, source })?;
                if !check(id, reader.as_ref(), &header)? {
                    done = false;
                }
            }
            if done {
                return Ok(());
            }
        }
    }
}

/// Heights of the running members.
fn snapshot<M: Member>(members: &[M]) -> Result<HashMap<usize, u64>, Error> {
    let mut heights = HashMap::new();
    for member in members {
        let Some(reader) = member.reader() else {
            continue;
        };
        let header = reader.current_header().map_err(|source| Error::Query {
            node: member.id(),
            source,
        })?;
        heights.insert(member.id(), header.number);
    }
    Ok(heights)
}

async fn poll_sync<E: Clock>(
    id: usize,
    reader: Arc<dyn Reader>,
    mut ticker: Ticker<E>,
    deadline: Deadline,
    mut stop: Signal,
) -> Result<(), Error> {
    let clock = ticker.context.clone();
    loop {
        select! {
            _ = &mut stop => {
                return Err(Error::Canceled);
            },
            expired = deadline.expired(&clock) => {
                return Err(expired.into());
            },
            _ = ticker.tick() => {},
        }
        let progress = reader
            .sync_progress()
            .map_err(|source| Error::Query { node: id, source })?;
        if progress.is_complete() {
            debug!(node = id, current = progress.current, "sync complete");
            return Ok(());
        }
    }
}
