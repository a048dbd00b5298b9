use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One raffle configuration. The worker only ever reads it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Raffle {
    pub id: u64,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Raffle {
    pub fn new(id: u64, name: impl Into<String>, is_active: bool) -> Self {
        Self {
            id,
            name: name.into(),
            is_active,
            created_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub wallet: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only outcome of a round that reached the recording step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WinnerRecord {
    pub id: u64,
    pub raffle_id: u64,
    pub wallet: String,
    pub amount_lamports: u64,
    // None when the winner transfer did not go through
    pub tx_signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WinnerRecord {
    pub fn new(id: u64, raffle_id: u64, wallet: &str, amount_lamports: u64, tx_signature: Option<&str>) -> Self {
        Self {
            id,
            raffle_id,
            wallet: wallet.to_string(),
            amount_lamports,
            tx_signature: tx_signature.map(str::to_string),
            created_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRatio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Default for SplitRatio {
    fn default() -> Self {
        Self {
            numerator: 7,
            denominator: 10,
        }
    }
}

impl SplitRatio {
    pub fn validate(&self) -> Result<()> {
        if self.denominator == 0 {
            return Err(Error::Config("split denominator must be positive".to_string()));
        }
        if self.numerator > self.denominator {
            return Err(Error::Config(format!(
                "split numerator {} exceeds denominator {}",
                self.numerator, self.denominator
            )));
        }
        Ok(())
    }
}

/// Winner/operator portions of a distributable amount.
///
/// The winner gets the floor of `amount * numerator / denominator`; whatever
/// the floor drops lands in the operator share, so the two always add back up
/// to the original amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub winner_share: u64,
    pub operator_share: u64,
}

impl Split {
    pub fn compute(distributable: u64, ratio: SplitRatio) -> Self {
        let winner_share = (distributable as u128 * ratio.numerator as u128 / ratio.denominator as u128) as u64;
        Self {
            winner_share,
            operator_share: distributable - winner_share,
        }
    }
}

/// How a round finds out what it may distribute.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SettlementMode {
    /// Works off the creator balance minus a reserve. Used on test networks
    /// where fee collection gives no usable signal.
    #[serde(rename = "test")]
    TestSettlement,
    /// Collects fees and distributes exactly the balance delta of the
    /// collection transaction.
    #[default]
    #[serde(rename = "production")]
    ProductionSettlement,
}

impl std::str::FromStr for SettlementMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "test" | "devnet" | "testsettlement" => Ok(Self::TestSettlement),
            "production" | "mainnet" | "productionsettlement" => Ok(Self::ProductionSettlement),
            other => Err(format!("Invalid settlement mode `{}`: test and production are supported", other)),
        }
    }
}

impl std::fmt::Display for SettlementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self {
            Self::TestSettlement => "test",
            Self::ProductionSettlement => "production",
        };
        write!(f, "{}", mode)
    }
}
