use std::sync::Arc;

use log::{error, info, warn};
use reqwest::Client;
use serde_json::Value;
use solana_client::{nonblocking::rpc_client::RpcClient, rpc_config::RpcSendTransactionConfig};
use solana_sdk::{
    commitment_config::CommitmentLevel,
    signature::Keypair,
    signer::Signer,
    transaction::VersionedTransaction,
};

use crate::{
    config::{self, Config},
    cycle::FeeCollector,
    error::{Result, TxError},
    SolanaClient,
};

const COLLECT_ACTION: &str = "collectCreatorFee";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectPath {
    /// PumpPortal signs and submits with the account behind the api key.
    Lightning,
    /// PumpPortal returns an unsigned transaction, signed here with the
    /// creator key and submitted through our own rpc.
    Local,
}

/// Creator fee collection through PumpPortal.
pub struct PumpPortal {
    http: Client,
    opts: config::PumpPortal,
    rpc: Arc<RpcClient>,
    creator: Arc<Keypair>,
}

impl PumpPortal {
    pub fn setup(config: &Config, chain: &SolanaClient) -> Result<Self> {
        let http = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            http,
            opts: config.pumpportal.clone(),
            rpc: chain.rpc.clone(),
            creator: chain.creator.clone(),
        })
    }

    pub fn path(&self) -> CollectPath {
        select_path(&self.opts)
    }

    async fn collect_via_lightning(&self) -> Result<Option<String>> {
        let api_key = match self.opts.api_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => {
                warn!("lightning collection requested but no api key is configured");
                return Ok(None);
            }
        };
        let mut form = collect_form(&self.opts);
        form.push(("priorityFee", self.opts.priority_fee.to_string()));

        let resp = self
            .http
            .post(self.opts.lightning_url.as_str())
            .query(&[("api-key", api_key)])
            .form(&form)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        info!("PumpPortal lightning collectCreatorFee response: {}", body);

        Ok(extract_signature(&body))
    }

    async fn collect_via_local(&self) -> Result<Option<String>> {
        let mut form = collect_form(&self.opts);
        form.push(("publicKey", self.creator.pubkey().to_string()));

        let raw = self
            .http
            .post(self.opts.local_url.as_str())
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let tx = sign_local_tx(&raw, &self.creator)?;

        let config = RpcSendTransactionConfig {
            preflight_commitment: Some(CommitmentLevel::Confirmed),
            ..Default::default()
        };
        let sig = self.rpc.send_transaction_with_config(&tx, config).await?;
        info!("sent collectCreatorFee via local rpc: {}", sig);
        Ok(Some(sig.to_string()))
    }
}

impl FeeCollector for PumpPortal {
    async fn collect_creator_fee(&self) -> Result<Option<String>> {
        let path = self.path();
        info!("collecting creator fees via PumpPortal ({:?})", path);
        let res = match path {
            CollectPath::Lightning => self.collect_via_lightning().await,
            CollectPath::Local => self.collect_via_local().await,
        };
        match res {
            Ok(Some(sig)) => Ok(Some(sig)),
            Ok(None) => {
                info!("collectCreatorFee completed without a signature, maybe no fees yet");
                Ok(None)
            }
            Err(e) => {
                error!("error while collecting creator fee: {}", e);
                Ok(None)
            }
        }
    }
}

fn select_path(opts: &config::PumpPortal) -> CollectPath {
    match opts.api_key.as_deref() {
        Some(key) if !key.trim().is_empty() => CollectPath::Lightning,
        _ => CollectPath::Local,
    }
}

fn collect_form(opts: &config::PumpPortal) -> Vec<(&'static str, String)> {
    let pool = if opts.pool.is_empty() { "pump" } else { opts.pool.as_str() };
    let mut form = vec![("action", COLLECT_ACTION.to_string()), ("pool", pool.to_string())];
    if let Some(mint) = opts.token_mint.as_ref().filter(|m| !m.is_empty()) {
        form.push(("mint", mint.clone()));
    }
    form
}

/// PumpPortal has reported the signature under all of these keys.
pub fn extract_signature(body: &Value) -> Option<String> {
    ["signature", "txSignature", "result"]
        .iter()
        .filter_map(|key| body.get(*key))
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Decodes an unsigned transaction returned by trade-local and signs it with
/// the creator key.
pub fn sign_local_tx(raw: &[u8], creator: &Keypair) -> Result<VersionedTransaction> {
    let unsigned: VersionedTransaction =
        bincode::deserialize(raw).map_err(|e| TxError::Decode(format!("trade-local tx: {}", e)))?;
    let signed = VersionedTransaction::try_new(unsigned.message, &[creator])
        .map_err(|e| TxError::Build(format!("signing trade-local tx: {}", e)))?;
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use solana_sdk::{
        hash::Hash,
        message::{v0, VersionedMessage},
        pubkey::Pubkey,
        signature::Signature,
        system_instruction,
    };

    use super::*;

    fn opts(api_key: Option<&str>, mint: Option<&str>) -> config::PumpPortal {
        config::PumpPortal {
            api_key: api_key.map(str::to_string),
            token_mint: mint.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn api_key_selects_lightning() {
        assert_eq!(select_path(&opts(Some("key"), None)), CollectPath::Lightning);
        assert_eq!(select_path(&opts(Some("  "), None)), CollectPath::Local);
        assert_eq!(select_path(&opts(None, None)), CollectPath::Local);
    }

    #[test]
    fn form_carries_mint_only_when_set() {
        let form = collect_form(&opts(None, Some("MintAddr")));
        assert!(form.contains(&("action", "collectCreatorFee".to_string())));
        assert!(form.contains(&("pool", "pump".to_string())));
        assert!(form.contains(&("mint", "MintAddr".to_string())));

        let form = collect_form(&opts(None, None));
        assert!(form.iter().all(|(k, _)| *k != "mint"));
    }

    #[test]
    fn signature_is_found_under_any_known_key() {
        assert_eq!(extract_signature(&json!({"signature": "abc"})), Some("abc".to_string()));
        assert_eq!(extract_signature(&json!({"txSignature": "def"})), Some("def".to_string()));
        assert_eq!(extract_signature(&json!({"signature": "", "result": "ghi"})), Some("ghi".to_string()));
        assert_eq!(extract_signature(&json!({"errors": ["no fees"]})), None);
        assert_eq!(extract_signature(&json!({"signature": null})), None);
    }

    #[test]
    fn local_tx_is_signed_by_creator() {
        let creator = Keypair::new();
        let ix = system_instruction::transfer(&creator.pubkey(), &Pubkey::new_unique(), 1);
        let msg = v0::Message::try_compile(&creator.pubkey(), &[ix], &[], Hash::new_unique()).unwrap();
        let unsigned = VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::V0(msg),
        };
        let raw = bincode::serialize(&unsigned).unwrap();

        let signed = sign_local_tx(&raw, &creator).unwrap();
        assert_ne!(signed.signatures[0], Signature::default());
        assert!(signed.verify_with_results().iter().all(|ok| *ok));
    }

    #[test]
    fn garbage_from_trade_local_is_rejected() {
        let creator = Keypair::new();
        assert!(sign_local_tx(b"<html>rate limited</html>", &creator).is_err());
    }
}
