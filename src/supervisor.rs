//! Owns the fleet of per-city pollers (§4.F).
//!
//! One task per configured city, tracked in a `JoinSet` the same way
//! `ReviewExecutor` tracks per-model review tasks: a task id recorded at
//! spawn time lets a panic or cancellation be attributed back to the city
//! that caused it, rather than surfacing as an anonymous `JoinError`.
//! Shutdown is cooperative — cancelling the shared token and draining the
//! `JoinSet` rather than aborting tasks mid-cycle.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::classifier::ClassifierBackend;
use crate::config::Config;
use crate::poller::Poller;
use crate::store::StateStore;
use crate::upstream::UpstreamFetcher;

pub struct Supervisor<S: StateStore + 'static, U: UpstreamFetcher + 'static, C: ClassifierBackend + 'static> {
    joinset: JoinSet<()>,
    city_by_task: HashMap<tokio::task::Id, String>,
    cancellation: CancellationToken,
    _types: PhantomData<(S, U, C)>,
}

impl<S: StateStore + 'static, U: UpstreamFetcher + 'static, C: ClassifierBackend + 'static>
    Supervisor<S, U, C>
{
    /// Spawns one poller per city named in `config.cities`.
    pub fn spawn_all(
        config: Arc<Config>,
        store: Arc<S>,
        upstream: Arc<U>,
        classifier: Arc<C>,
    ) -> Self {
        let cancellation = CancellationToken::new();
        let mut joinset = JoinSet::new();
        let mut city_by_task = HashMap::new();

        for city in config.cities.keys() {
            let poller = Poller::new(
                city.clone(),
                config.clone(),
                store.clone(),
                upstream.clone(),
                classifier.clone(),
                cancellation.clone(),
            );
            let handle = joinset.spawn(async move { poller.run().await });
            city_by_task.insert(handle.id(), city.clone());
        }

        Self {
            joinset,
            city_by_task,
            cancellation,
            _types: PhantomData,
        }
    }

    /// A clone of the shared token; cancelling it (e.g. from a ctrl-c
    /// handler) signals every poller to stop at its next suspension point.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Cancels every poller and waits for them all to exit, logging panics
    /// and unexpected cancellations against the city that produced them.
    pub async fn shutdown(mut self) {
        self.cancellation.cancel();
        while let Some(result) = self.joinset.join_next_with_id().await {
            match result {
                Ok((id, ())) => {
                    tracing::debug!(city = %self.city_for(id), "poller exited");
                }
                Err(e) => {
                    let city = self.city_for(e.id());
                    if e.is_panic() {
                        tracing::error!(city = %city, "poller task panicked");
                    } else {
                        tracing::warn!(city = %city, "poller task cancelled");
                    }
                }
            }
        }
    }

    fn city_for(&self, id: tokio::task::Id) -> &str {
        self.city_by_task
            .get(&id)
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}
