use std::{future::Future, str::FromStr, time::Duration};

use solana_sdk::{pubkey::Pubkey, signature::Keypair, signer::Signer};

use crate::{
    config::Config,
    error::{Error, Result},
    LAMPORTS_PER_SOL,
};

#[inline(always)]
pub fn extract_keypair_from_config(config: &Config) -> Result<(Keypair, Pubkey)> {
    extract_keypair_from_str(&config.chain.creator_secret)
}

/// Decodes a base58 encoded 64-byte secret key.
pub fn extract_keypair_from_str(sk_str: &str) -> Result<(Keypair, Pubkey)> {
    let bytes = bs58::decode(sk_str.trim())
        .into_vec()
        .map_err(|e| Error::InvalidKey(format!("creator secret is not base58: {}", e)))?;
    let keypair =
        Keypair::from_bytes(&bytes).map_err(|e| Error::InvalidKey(format!("creator secret rejected: {}", e)))?;
    let pubkey = keypair.pubkey();
    Ok((keypair, pubkey))
}

/// Normalizes a wallet address and checks it is a valid public key.
pub fn parse_wallet(addr: &str) -> Result<Pubkey> {
    let cleaned = addr.trim();
    if cleaned.is_empty() {
        return Err(Error::InvalidKey("wallet address is required".to_string()));
    }
    Pubkey::from_str(cleaned).map_err(|_| Error::InvalidKey(format!("invalid wallet address `{}`", cleaned)))
}

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Runs `fut` under `limit`, turning an elapsed deadline into `Error::Timeout`.
pub async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(format!("{} after {}s", what, limit.as_secs()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_base58() {
        let keypair = Keypair::new();
        let encoded = bs58::encode(keypair.to_bytes()).into_string();
        let (decoded, pubkey) = extract_keypair_from_str(&format!(" {} ", encoded)).unwrap();
        assert_eq!(pubkey, keypair.pubkey());
        assert_eq!(decoded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn garbage_secret_is_rejected() {
        assert!(matches!(extract_keypair_from_str("not-base58-0OIl"), Err(Error::InvalidKey(_))));
        assert!(matches!(extract_keypair_from_str("3mJr7AoUXx2Wqd"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn wallet_validation() {
        let wallet = Pubkey::new_unique();
        assert_eq!(parse_wallet(&format!("  {}\n", wallet)).unwrap(), wallet);
        assert!(parse_wallet("").is_err());
        assert!(parse_wallet("   ").is_err());
        assert!(parse_wallet("definitely-not-a-key").is_err());
    }

    #[test]
    fn lamports_conversion() {
        assert_eq!(lamports_to_sol(1_500_000_000), 1.5);
        assert_eq!(lamports_to_sol(0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_reports_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1u64)
        };
        let res = bounded(Duration::from_secs(5), "balance query", slow).await;
        match res {
            Err(Error::Timeout(msg)) => assert!(msg.contains("balance query")),
            other => panic!("expected timeout, got {:?}", other),
        }

        let fast = async { Ok(2u64) };
        assert_eq!(bounded(Duration::from_secs(5), "fast", fast).await.unwrap(), 2);
    }
}
