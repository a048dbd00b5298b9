pub mod config;
pub mod cycle;
pub mod db;
pub mod error;
pub mod model;
pub mod pumpportal;
pub mod scheduler;
pub mod utils;

use std::{str::FromStr, sync::Arc};

use log::{debug, info};
use solana_client::{nonblocking::rpc_client::RpcClient, rpc_config::RpcTransactionConfig};
use solana_sdk::{
    commitment_config::CommitmentConfig,
    message::{v0, VersionedMessage},
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    system_instruction,
    transaction::VersionedTransaction,
};
use solana_transaction_status::UiTransactionEncoding;

use crate::{
    config::Config,
    cycle::{BalanceOracle, FundsTransfer},
    error::{Error, Result, TxError},
    utils::{extract_keypair_from_config, parse_wallet},
};

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Rpc access for the creator wallet: balance, fee deltas and transfers.
pub struct SolanaClient {
    pub rpc: Arc<RpcClient>,
    pub creator: Arc<Keypair>,
    pub creator_addr: Pubkey,
}

impl std::fmt::Debug for SolanaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolanaClient")
            .field("endpoint", &self.rpc.url())
            .field("creator", &self.creator_addr)
            .finish()
    }
}

impl SolanaClient {
    pub fn setup(config: &Config) -> Result<Self> {
        let (creator, creator_addr) = extract_keypair_from_config(config)?;
        let rpc = RpcClient::new_with_timeout_and_commitment(
            config.chain.endpoint.clone(),
            config.request_timeout(),
            CommitmentConfig::confirmed(),
        );
        info!("rpc endpoint {}, creator wallet {}", config.chain.endpoint, creator_addr);

        Ok(Self {
            rpc: Arc::new(rpc),
            creator: Arc::new(creator),
            creator_addr,
        })
    }

    pub async fn balance(&self, address: &Pubkey) -> Result<u64> {
        Ok(self.rpc.get_balance(address).await?)
    }

    /// Builds, signs and submits a system transfer from the creator wallet,
    /// waiting for confirmation.
    pub async fn transfer(&self, to: &Pubkey, lamports: u64) -> Result<Signature> {
        let blockhash = self.rpc.get_latest_blockhash().await?;
        let ix = system_instruction::transfer(&self.creator_addr, to, lamports);
        let msg = v0::Message::try_compile(&self.creator_addr, &[ix], &[], blockhash)
            .map_err(|e| TxError::Build(e.to_string()))?;
        let tx = VersionedTransaction::try_new(VersionedMessage::V0(msg), &[self.creator.as_ref()])
            .map_err(|e| TxError::Build(e.to_string()))?;

        let sig = self.rpc.send_and_confirm_transaction(&tx).await?;
        info!("sent {} lamports from {} to {}, tx={}", lamports, self.creator_addr, to, sig);
        Ok(sig)
    }

    pub async fn balance_delta(&self, signature: &Signature, owner: &Pubkey) -> Result<i64> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let confirmed = self.rpc.get_transaction_with_config(signature, config).await?;
        let meta = confirmed
            .transaction
            .meta
            .ok_or_else(|| TxError::MissingMeta(format!("tx {} has no status meta", signature)))?;
        let decoded = confirmed
            .transaction
            .transaction
            .decode()
            .ok_or_else(|| TxError::Decode(format!("tx {} could not be decoded", signature)))?;
        if meta.err.is_some() {
            debug!("tx {} failed on chain: {:?}", signature, meta.err);
        }

        let delta = balance_delta(
            decoded.message.static_account_keys(),
            &meta.pre_balances,
            &meta.post_balances,
            owner,
        )?;
        debug!("tx {} moved {} lamports for {}", signature, delta, owner);
        Ok(delta)
    }
}

/// Post minus pre balance of `owner` within one transaction.
pub fn balance_delta(keys: &[Pubkey], pre: &[u64], post: &[u64], owner: &Pubkey) -> Result<i64> {
    let idx = keys
        .iter()
        .position(|k| k == owner)
        .ok_or_else(|| TxError::Reconcile(format!("{} is not an account of the transaction", owner)))?;
    match (pre.get(idx), post.get(idx)) {
        (Some(&pre), Some(&post)) => Ok(post as i64 - pre as i64),
        _ => Err(TxError::MissingMeta(format!("no balances recorded for account index {}", idx)).into()),
    }
}

impl BalanceOracle for SolanaClient {
    async fn get_creator_balance(&self) -> Result<u64> {
        self.balance(&self.creator_addr).await
    }

    async fn get_creator_fee_delta_from_tx(&self, signature: &str) -> Result<i64> {
        let sig = Signature::from_str(signature.trim())
            .map_err(|e| Error::Tx(TxError::Decode(format!("bad signature {}: {}", signature, e))))?;
        self.balance_delta(&sig, &self.creator_addr).await
    }
}

impl FundsTransfer for SolanaClient {
    async fn send_funds(&self, to: &str, lamports: u64) -> Result<String> {
        let to = parse_wallet(to)?;
        Ok(self.transfer(&to, lamports).await?.to_string())
    }
}
