//! Index-cursor blocking queries.
//!
//! A [`BlockingQuery`] issues one read per [`next`](BlockingQuery::next) call:
//! the first without an index, every later one with the index returned by the
//! previous read and a bounded wait. The backend answers as soon as the value
//! changes, or unchanged once the wait elapses; both are ordinary rounds.
//!
//! ```no_run
//! # async fn demo(backend: &dyn consul_coord::consul::Backend) -> consul_coord::Result<()> {
//! use consul_coord::coordination::watch;
//! use std::time::Duration;
//!
//! // Block until at least 3 instances of `web` pass their checks.
//! let healthy = watch::service(backend, "web", &consul_coord::consul::HealthFilter::passing(), Duration::from_secs(10))
//!     .watch_while(|instances| instances.len() <= 2)
//!     .await?;
//! # Ok(()) }
//! ```

use futures_util::future::BoxFuture;
use std::time::Duration;

use crate::common::Result;
use crate::consul::{Backend, HealthCheck, HealthFilter, Indexed, KvPair, QueryOptions, ServiceInstance};

type Fetch<'a, T> = Box<dyn FnMut(QueryOptions) -> BoxFuture<'a, Result<Indexed<T>>> + Send + 'a>;

/// Cursor of one watch loop. Never shared between watches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchState {
    /// Highest index observed so far; `None` before the first read
    pub last_index: Option<u64>,
    /// Reads issued so far
    pub rounds: usize,
}

/// A lazy, non-restartable sequence of reads of one backend path.
pub struct BlockingQuery<'a, T> {
    fetch: Fetch<'a, T>,
    wait: Duration,
    state: WatchState,
}

impl<'a, T> BlockingQuery<'a, T> {
    /// `fetch` performs one read with the options it is handed.
    pub fn new<F>(wait: Duration, fetch: F) -> Self
    where
        F: FnMut(QueryOptions) -> BoxFuture<'a, Result<Indexed<T>>> + Send + 'a,
    {
        Self {
            fetch: Box::new(fetch),
            wait,
            state: WatchState::default(),
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Issue the next read and advance the cursor.
    ///
    /// The cursor never moves backwards, even if the backend reports a lower
    /// index than a previous read.
    pub async fn next(&mut self) -> Result<T> {
        let opts = match self.state.last_index {
            None => QueryOptions::default(),
            Some(index) => QueryOptions::blocking(index, self.wait),
        };

        let Indexed { value, index } = (self.fetch)(opts).await?;
        self.state.last_index = Some(match self.state.last_index {
            Some(last) => last.max(index),
            None => index,
        });
        self.state.rounds += 1;
        Ok(value)
    }

    /// Keep reading while `keep_waiting` holds for the observed value and
    /// return the first value for which it does not.
    ///
    /// Any failed read aborts the whole watch; retrying is up to the caller.
    pub async fn watch_while<P>(&mut self, mut keep_waiting: P) -> Result<T>
    where
        P: FnMut(&T) -> bool,
    {
        loop {
            let value = self.next().await?;
            if !keep_waiting(&value) {
                return Ok(value);
            }
            tracing::trace!(index = ?self.state.last_index, "Watched value unchanged, polling again");
        }
    }
}

/// Watch a KV entry.
pub fn kv<'a>(backend: &'a dyn Backend, key: &'a str, wait: Duration) -> BlockingQuery<'a, Option<KvPair>> {
    BlockingQuery::new(wait, move |opts| backend.kv_get(key, opts))
}

/// Watch the instances of a service matching `filter`.
pub fn service<'a>(
    backend: &'a dyn Backend,
    service: &'a str,
    filter: &'a HealthFilter,
    wait: Duration,
) -> BlockingQuery<'a, Vec<ServiceInstance>> {
    BlockingQuery::new(wait, move |opts| backend.health_service(service, filter, opts))
}

/// Watch the checks registered on a node.
pub fn node<'a>(backend: &'a dyn Backend, node: &'a str, wait: Duration) -> BlockingQuery<'a, Vec<HealthCheck>> {
    BlockingQuery::new(wait, move |opts| backend.health_node(node, opts))
}
