use std::{future::Future, panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use log::{error, info};

use crate::{
    cycle::{
        BalanceOracle, CycleOutcome, DistributionCycle, FeeCollector, FundsTransfer, ParticipantRegistry, RaffleStore,
        WinnerLedger,
    },
    error::Result,
};

/// Anything the scheduler can drive once per interval.
pub trait Round {
    fn run_once(&self) -> impl Future<Output = Result<CycleOutcome>>;
}

impl<S, F, C> Round for DistributionCycle<S, F, C>
where
    S: RaffleStore + ParticipantRegistry + WinnerLedger + Sync,
    F: FeeCollector + Sync,
    C: BalanceOracle + FundsTransfer + Sync,
{
    fn run_once(&self) -> impl Future<Output = Result<CycleOutcome>> {
        DistributionCycle::run_once(self)
    }
}

pub struct Scheduler<R> {
    round: R,
    interval: Duration,
}

impl<R: Round> Scheduler<R> {
    pub fn new(round: R, interval: Duration) -> Self {
        Self { round, interval }
    }

    /// Runs rounds back to back with `interval` of sleep in between until
    /// `shutdown` resolves. Shutdown is only observed while sleeping, so a
    /// round in flight always finishes. Returns the number of rounds run.
    pub async fn main_loop<Sh>(&self, shutdown: Sh) -> u64
    where
        Sh: Future<Output = ()>,
    {
        info!("starting raffle loop, interval {}s", self.interval.as_secs());
        tokio::pin!(shutdown);
        let mut rounds = 0u64;

        loop {
            rounds += 1;
            match AssertUnwindSafe(self.round.run_once()).catch_unwind().await {
                Ok(Ok(outcome)) => info!("round {} {}", rounds, outcome),
                Ok(Err(e)) => error!("round {} failed unexpectedly: {}", rounds, e),
                Err(panic) => error!("round {} panicked: {}", rounds, panic_message(&*panic)),
            }

            info!("sleeping for {} seconds...", self.interval.as_secs());
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested, leaving raffle loop after {} rounds", rounds);
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        rounds
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
