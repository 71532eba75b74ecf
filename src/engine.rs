use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::checker::Dispatcher;
use crate::models::{CheckKind, CycleReport};
use crate::report::Reporter;
use crate::store::StatusCache;

/// Drives refresh cycles: snapshot the registry, hand every address to the
/// dispatcher, never wait on the outcome.
pub struct Orchestrator {
    cache: StatusCache,
    dispatcher: Arc<dyn Dispatcher>,
    reporter: Arc<dyn Reporter>,
    interval: Duration,
}

impl Orchestrator {
    pub fn new(
        cache: StatusCache,
        dispatcher: Arc<dyn Dispatcher>,
        reporter: Arc<dyn Reporter>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            dispatcher,
            reporter,
            interval,
        }
    }

    /// One refresh cycle. Both sets are read before anything is dispatched,
    /// so a failed read dispatches nothing and later registry changes do not
    /// leak into this cycle.
    pub async fn refresh_all(&self) -> CycleReport {
        let snapshot = future::try_join(
            self.cache.registry(CheckKind::Ping),
            self.cache.registry(CheckKind::Query),
        )
        .await;

        let (ping, query) = match snapshot {
            Ok(sets) => sets,
            Err(e) => {
                self.reporter.report("reading server registry", &e);
                return CycleReport::default();
            }
        };

        info!("{} servers in ping database", ping.len());
        info!("{} servers in query database", query.len());

        let report = CycleReport {
            ping: ping.len(),
            query: query.len(),
        };

        for address in ping {
            self.dispatcher.dispatch(address, CheckKind::Ping);
        }
        for address in query {
            self.dispatcher.dispatch(address, CheckKind::Query);
        }

        report
    }

    /// Runs a cycle immediately, then once per interval until `shutdown`
    /// turns true. Cycles are not serialized against each other's checks.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Refreshing servers every {:?}", self.interval);
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.refresh_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("refresh loop stopped");
    }
}
