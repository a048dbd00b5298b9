//! One distribution round.
//!
//! A round loads the active raffle, works out how many lamports it may hand
//! out, splits them, draws a winner, pays the operator, pays the winner and
//! appends the outcome to the winner ledger. Everything up to the operator
//! payment may bail out without leaving a trace. Once the operator has been
//! paid the round always tries to record, even when the winner payment failed.

use std::{fmt, future::Future, time::Duration};

use log::{debug, error, info, warn};
use rand::Rng;

use crate::{
    config::Config,
    error::{Error, Result},
    model::{Participant, Raffle, SettlementMode, Split, SplitRatio, WinnerRecord},
    utils::bounded,
};

const LEDGER_ATTEMPTS: u32 = 3;
const LEDGER_BACKOFF: Duration = Duration::from_secs(2);

pub trait RaffleStore {
    /// The raffle with `raffle_id`, only if it is active.
    fn get_active_raffle(&self, raffle_id: u64) -> impl Future<Output = Result<Option<Raffle>>> + Send;
}

pub trait ParticipantRegistry {
    /// One participant drawn uniformly at random, `None` for an empty pool.
    fn get_random_participant(&self) -> impl Future<Output = Result<Option<Participant>>> + Send;
}

/// Append-only winner ledger.
///
/// Writing is split in two so a caller can reserve the id once and repeat
/// the write after a lost reply without appending the same payout twice.
pub trait WinnerLedger {
    /// Reserves the id of the next record. Ids are never reused.
    fn next_winner_id(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Appends `record` unless a record with the same id is already stored.
    fn put_winner(&self, record: &WinnerRecord) -> impl Future<Output = Result<()>> + Send;

    fn log_winner(
        &self,
        raffle_id: u64,
        wallet: &str,
        amount_lamports: u64,
        tx_signature: Option<&str>,
    ) -> impl Future<Output = Result<WinnerRecord>> + Send
    where
        Self: Sync,
    {
        async move {
            let id = self.next_winner_id().await?;
            let record = WinnerRecord::new(id, raffle_id, wallet, amount_lamports, tx_signature);
            self.put_winner(&record).await?;
            Ok(record)
        }
    }
}

pub trait FeeCollector {
    /// Signature of the collection transaction, `None` when nothing was
    /// collected or the outcome is unknown.
    fn collect_creator_fee(&self) -> impl Future<Output = Result<Option<String>>> + Send;
}

pub trait BalanceOracle {
    fn get_creator_balance(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Lamports the creator wallet gained (or lost) in transaction `signature`.
    fn get_creator_fee_delta_from_tx(&self, signature: &str) -> impl Future<Output = Result<i64>> + Send;
}

pub trait FundsTransfer {
    fn send_funds(&self, to: &str, lamports: u64) -> impl Future<Output = Result<String>> + Send;
}

/// Why a round found nothing to distribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundsShortfall {
    NoCollectionSignature,
    CollectorFailed(String),
    OracleFailed(String),
    NonPositiveDelta(i64),
    BelowReserve { balance: u64, reserve: u64 },
}

impl fmt::Display for FundsShortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCollectionSignature => write!(f, "fee collection returned no signature"),
            Self::CollectorFailed(e) => write!(f, "fee collection failed: {}", e),
            Self::OracleFailed(e) => write!(f, "balance lookup failed: {}", e),
            Self::NonPositiveDelta(delta) => write!(f, "creator fee delta is {} lamports", delta),
            Self::BelowReserve { balance, reserve } => {
                write!(f, "balance {} lamports does not exceed reserve {}", balance, reserve)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub raffle_id: u64,
    pub wallet: String,
    pub distributable: u64,
    pub split: Split,
    pub operator_tx: String,
    pub winner_tx: Option<String>,
    pub record_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(Distribution),
    AbortedNoRaffle,
    AbortedNoFunds(FundsShortfall),
    AbortedNoParticipant,
    AbortedOperatorTransfer,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(d) => write!(
                f,
                "completed: record #{} raffle {} winner {} got {} lamports (tx {:?}), operator got {} (tx {})",
                d.record_id, d.raffle_id, d.wallet, d.split.winner_share, d.winner_tx, d.split.operator_share, d.operator_tx
            ),
            Self::AbortedNoRaffle => write!(f, "aborted: no active raffle"),
            Self::AbortedNoFunds(why) => write!(f, "aborted: nothing to distribute ({})", why),
            Self::AbortedNoParticipant => write!(f, "aborted: no participants"),
            Self::AbortedOperatorTransfer => write!(f, "aborted: operator transfer failed"),
        }
    }
}

/// The subset of configuration a round reads.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub raffle_id: u64,
    pub mode: SettlementMode,
    pub reserve_lamports: u64,
    pub split: SplitRatio,
    pub settlement_delay: Duration,
    pub request_timeout: Duration,
    pub transfer_timeout: Duration,
    pub owner_wallet: String,
}

impl CycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            raffle_id: config.raffle.active_raffle_id,
            mode: config.chain.settlement_mode,
            reserve_lamports: config.raffle.reserve_lamports,
            split: config.raffle.split,
            settlement_delay: Duration::from_secs(config.raffle.settlement_delay),
            request_timeout: config.request_timeout(),
            transfer_timeout: config.transfer_timeout(),
            owner_wallet: config.chain.owner_wallet.clone(),
        }
    }
}

pub struct DistributionCycle<S, F, C> {
    store: S,
    collector: F,
    chain: C,
    settings: CycleSettings,
}

impl<S, F, C> DistributionCycle<S, F, C>
where
    S: RaffleStore + ParticipantRegistry + WinnerLedger + Sync,
    F: FeeCollector + Sync,
    C: BalanceOracle + FundsTransfer + Sync,
{
    pub fn new(store: S, collector: F, chain: C, settings: CycleSettings) -> Self {
        Self {
            store,
            collector,
            chain,
            settings,
        }
    }

    pub fn settings(&self) -> &CycleSettings {
        &self.settings
    }

    /// Runs one round. Expected dead ends come back as an aborted outcome;
    /// `Err` means storage broke underneath the round.
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        let raffle = match self.store.get_active_raffle(self.settings.raffle_id).await? {
            Some(raffle) => raffle,
            None => {
                info!("no active raffle with id {}", self.settings.raffle_id);
                return Ok(CycleOutcome::AbortedNoRaffle);
            }
        };
        debug!("raffle {} ({}) loaded, mode {}", raffle.id, raffle.name, self.settings.mode);

        let distributable = match self.acquire_funds().await {
            Ok(lamports) => lamports,
            Err(why) => {
                info!("nothing to distribute: {}", why);
                return Ok(CycleOutcome::AbortedNoFunds(why));
            }
        };

        let split = Split::compute(distributable, self.settings.split);
        info!(
            "distributable: {}, operator part: {}, raffle part: {}",
            distributable, split.operator_share, split.winner_share
        );

        let participant = match self.store.get_random_participant().await? {
            Some(p) => p,
            None => {
                info!("no participants registered");
                return Ok(CycleOutcome::AbortedNoParticipant);
            }
        };
        info!("selected winner wallet: {}", participant.wallet);

        let operator_tx = match self.transfer(&self.settings.owner_wallet, split.operator_share).await {
            Ok(sig) => {
                info!("operator tx: {}", sig);
                sig
            }
            Err(e) => {
                error!("operator transfer of {} lamports failed: {}", split.operator_share, e);
                return Ok(CycleOutcome::AbortedOperatorTransfer);
            }
        };

        let winner_tx = match self.transfer(&participant.wallet, split.winner_share).await {
            Ok(sig) => {
                info!("winner tx: {}", sig);
                Some(sig)
            }
            Err(e) => {
                error!(
                    "winner transfer of {} lamports to {} failed, recording without signature: {}",
                    split.winner_share, participant.wallet, e
                );
                None
            }
        };

        let record = self
            .record(raffle.id, &participant.wallet, split.winner_share, winner_tx.as_deref(), &operator_tx)
            .await?;
        info!("raffle winner logged as record #{}", record.id);

        Ok(CycleOutcome::Completed(Distribution {
            raffle_id: raffle.id,
            wallet: participant.wallet,
            distributable,
            split,
            operator_tx,
            winner_tx,
            record_id: record.id,
        }))
    }

    async fn acquire_funds(&self) -> std::result::Result<u64, FundsShortfall> {
        let limit = self.settings.request_timeout;
        match self.settings.mode {
            SettlementMode::TestSettlement => {
                let balance = bounded(limit, "creator balance query", self.chain.get_creator_balance())
                    .await
                    .map_err(|e| FundsShortfall::OracleFailed(e.to_string()))?;
                info!("creator balance: {} lamports", balance);

                let reserve = self.settings.reserve_lamports;
                match balance.checked_sub(reserve) {
                    Some(rest) if rest > 0 => Ok(rest),
                    _ => Err(FundsShortfall::BelowReserve { balance, reserve }),
                }
            }
            SettlementMode::ProductionSettlement => {
                let sig = bounded(limit, "creator fee collection", self.collector.collect_creator_fee())
                    .await
                    .map_err(|e| FundsShortfall::CollectorFailed(e.to_string()))?
                    .ok_or(FundsShortfall::NoCollectionSignature)?;
                info!("collectCreatorFee tx signature: {}", sig);

                tokio::time::sleep(self.settings.settlement_delay).await;

                let delta = bounded(limit, "fee delta lookup", self.chain.get_creator_fee_delta_from_tx(&sig))
                    .await
                    .map_err(|e| FundsShortfall::OracleFailed(e.to_string()))?;
                if delta <= 0 {
                    return Err(FundsShortfall::NonPositiveDelta(delta));
                }
                Ok(delta as u64)
            }
        }
    }

    async fn transfer(&self, to: &str, lamports: u64) -> Result<String> {
        bounded(
            self.settings.transfer_timeout,
            "funds transfer",
            self.chain.send_funds(to, lamports),
        )
        .await
    }

    // The operator is already paid here, so a failed write is retried
    // before the round gives up and surfaces both signatures. The record and
    // its id are fixed by the first attempt that gets an id.
    async fn record(
        &self,
        raffle_id: u64,
        wallet: &str,
        amount: u64,
        winner_tx: Option<&str>,
        operator_tx: &str,
    ) -> Result<WinnerRecord> {
        let mut pending = None;
        let mut attempt = 1;
        loop {
            match self.write_record(&mut pending, raffle_id, wallet, amount, winner_tx).await {
                Ok(record) => return Ok(record),
                Err(e) if attempt < LEDGER_ATTEMPTS => {
                    warn!("recording winner failed (attempt {}/{}): {}", attempt, LEDGER_ATTEMPTS, e);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    tokio::time::sleep(LEDGER_BACKOFF * attempt + jitter).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "UNRECORDED PAYOUT raffle={} wallet={} amount={} winner_tx={:?} operator_tx={} record={:?}: {}",
                        raffle_id,
                        wallet,
                        amount,
                        winner_tx,
                        operator_tx,
                        pending.as_ref().map(|r: &WinnerRecord| r.id),
                        e
                    );
                    return Err(Error::Unknown(format!(
                        "winner record lost after operator tx {}: {}",
                        operator_tx, e
                    )));
                }
            }
        }
    }

    async fn write_record(
        &self,
        pending: &mut Option<WinnerRecord>,
        raffle_id: u64,
        wallet: &str,
        amount: u64,
        winner_tx: Option<&str>,
    ) -> Result<WinnerRecord> {
        let record = match pending.clone() {
            Some(record) => record,
            None => {
                let id = self.store.next_winner_id().await?;
                let record = WinnerRecord::new(id, raffle_id, wallet, amount, winner_tx);
                *pending = Some(record.clone());
                record
            }
        };
        self.store.put_winner(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Mutex,
        },
    };

    use chrono::Utc;

    use super::*;

    /// In-memory store that counts every call it receives.
    ///
    /// `ledger_failures` writes fail before touching the ledger,
    /// `lost_replies` writes are stored and then reported as failed.
    #[derive(Default)]
    pub struct MemStore {
        pub raffle: Option<Raffle>,
        pub participants: Vec<String>,
        pub records: Mutex<Vec<WinnerRecord>>,
        pub seq: AtomicU64,
        pub ledger_failures: AtomicUsize,
        pub lost_replies: AtomicUsize,
        pub ledger_writes: AtomicUsize,
        pub registry_reads: AtomicUsize,
        pub raffle_reads: AtomicUsize,
    }

    impl MemStore {
        pub fn with_raffle(participants: &[&str]) -> Self {
            Self {
                raffle: Some(Raffle::new(1, "creator fee raffle", true)),
                participants: participants.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn records(&self) -> Vec<WinnerRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    impl RaffleStore for MemStore {
        async fn get_active_raffle(&self, raffle_id: u64) -> Result<Option<Raffle>> {
            self.raffle_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.raffle.clone().filter(|r| r.id == raffle_id && r.is_active))
        }
    }

    impl ParticipantRegistry for MemStore {
        async fn get_random_participant(&self) -> Result<Option<Participant>> {
            self.registry_reads.fetch_add(1, Ordering::SeqCst);
            if self.participants.is_empty() {
                return Ok(None);
            }
            let idx = rand::thread_rng().gen_range(0..self.participants.len());
            Ok(Some(Participant {
                wallet: self.participants[idx].clone(),
                created_at: Utc::now(),
            }))
        }
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl WinnerLedger for MemStore {
        async fn next_winner_id(&self) -> Result<u64> {
            Ok(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn put_winner(&self, record: &WinnerRecord) -> Result<()> {
            self.ledger_writes.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.ledger_failures) {
                return Err(Error::Unknown("ledger unavailable".to_string()));
            }
            {
                let mut records = self.records.lock().unwrap();
                if !records.iter().any(|r| r.id == record.id) {
                    records.push(record.clone());
                }
            }
            if take_one(&self.lost_replies) {
                return Err(Error::Unknown("connection reset after write".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct ScriptedCollector {
        pub replies: Mutex<VecDeque<Result<Option<String>>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedCollector {
        pub fn returning(replies: Vec<Result<Option<String>>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FeeCollector for ScriptedCollector {
        async fn collect_creator_fee(&self) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Fault {
        Fail,
        Hang,
    }

    async fn inject(fault: Option<Fault>, what: &str) -> Result<()> {
        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(Error::Unknown(format!("{} failed", what))),
            Some(Fault::Hang) => futures::future::pending().await,
        }
    }

    /// Fake chain. Transfers to wallets listed in `reject` fail, transfers to
    /// wallets in `stall` never finish, `oracle` breaks both balance reads.
    pub struct FakeChain {
        pub balance: u64,
        pub delta: i64,
        pub oracle: Option<Fault>,
        pub reject: Vec<String>,
        pub stall: Vec<String>,
        pub transfers: Mutex<Vec<(String, u64)>>,
        pub delta_lookups: Mutex<Vec<(String, tokio::time::Instant)>>,
    }

    impl FakeChain {
        pub fn new(balance: u64, delta: i64) -> Self {
            Self {
                balance,
                delta,
                oracle: None,
                reject: Vec::new(),
                stall: Vec::new(),
                transfers: Mutex::new(Vec::new()),
                delta_lookups: Mutex::new(Vec::new()),
            }
        }

        pub fn rejecting(mut self, wallet: &str) -> Self {
            self.reject.push(wallet.to_string());
            self
        }

        pub fn stalling(mut self, wallet: &str) -> Self {
            self.stall.push(wallet.to_string());
            self
        }

        pub fn with_oracle(mut self, fault: Fault) -> Self {
            self.oracle = Some(fault);
            self
        }

        pub fn transfers(&self) -> Vec<(String, u64)> {
            self.transfers.lock().unwrap().clone()
        }
    }

    impl BalanceOracle for FakeChain {
        async fn get_creator_balance(&self) -> Result<u64> {
            inject(self.oracle, "balance query").await?;
            Ok(self.balance)
        }

        async fn get_creator_fee_delta_from_tx(&self, signature: &str) -> Result<i64> {
            self.delta_lookups
                .lock()
                .unwrap()
                .push((signature.to_string(), tokio::time::Instant::now()));
            inject(self.oracle, "transaction lookup").await?;
            Ok(self.delta)
        }
    }

    impl FundsTransfer for FakeChain {
        async fn send_funds(&self, to: &str, lamports: u64) -> Result<String> {
            if self.stall.iter().any(|w| w == to) {
                inject(Some(Fault::Hang), "transfer").await?;
            }
            if self.reject.iter().any(|w| w == to) {
                return Err(Error::Unknown(format!("transfer to {} rejected", to)));
            }
            let mut transfers = self.transfers.lock().unwrap();
            transfers.push((to.to_string(), lamports));
            Ok(format!("sig-{}", transfers.len()))
        }
    }

    pub const OWNER: &str = "OwnerWa11et";

    pub fn settings(mode: SettlementMode) -> CycleSettings {
        CycleSettings {
            raffle_id: 1,
            mode,
            reserve_lamports: 2_000_000,
            split: SplitRatio::default(),
            settlement_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(60),
            owner_wallet: OWNER.to_string(),
        }
    }
}
