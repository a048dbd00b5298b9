use chrono::Utc;
use derive_more::Display;
use log::debug;
use redis::{aio::ConnectionManager, Client};

use crate::{
    cycle::{ParticipantRegistry, RaffleStore, WinnerLedger},
    error::{Error, Result},
    model::{Participant, Raffle, WinnerRecord},
};

const PARTICIPANTS: &str = "participants";
const WINNERS: &str = "winners";
const WINNERS_SEQ: &str = "winners:seq";

fn raffle_key(id: u64) -> String {
    format!("raffle:{}", id)
}

fn participant_key(wallet: &str) -> String {
    format!("participant:{}", wallet)
}

fn winner_key(id: u64) -> String {
    format!("winner:{}", id)
}

// KEYS[1] winner:{id}, KEYS[2] winners list, ARGV[1] record json.
// The list push only happens together with the first write of the id.
const PUT_WINNER: &str = r"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proto {
    Url,
    Unix,
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self {
            Self::Unix => "unix socket",
            Self::Url => "redis",
        };
        write!(f, "{}", proto)
    }
}

impl Proto {
    pub fn of(endpoint: &str) -> Self {
        if endpoint.starts_with("unix:") || endpoint.starts_with("redis+unix:") {
            Proto::Unix
        } else {
            Proto::Url
        }
    }
}

/// Redis backed raffle table, participant registry and winner ledger.
///
/// The http service and the worker share the same keys. Every write is a
/// single command or script, so no cross-key locking is needed.
#[derive(Clone, Display)]
#[display(fmt = "{}, {}", proto, endpoint)]
pub struct Db {
    endpoint: String,
    proto: Proto,
    conn: ConnectionManager,
}

impl Db {
    /// connect to a redis server
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let proto = Proto::of(endpoint);
        if proto == Proto::Unix {
            return Err(Error::NotSupport("Unix socket is not supported currently".to_string()));
        }
        let client = Client::open(endpoint)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            proto,
            conn,
        })
    }

    /// insert or replace a raffle
    pub async fn put_raffle(&self, raffle: &Raffle) -> Result<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(raffle)?;
        Ok(redis::cmd("SET").arg(raffle_key(raffle.id)).arg(data).query_async(&mut conn).await?)
    }

    pub async fn get_raffle(&self, id: u64) -> Result<Option<Raffle>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(raffle_key(id)).query_async(&mut conn).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Adds `wallet` to the registry. Returns false when it was already there.
    pub async fn add_participant(&self, wallet: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: u64 = redis::cmd("SADD").arg(PARTICIPANTS).arg(wallet).query_async(&mut conn).await?;
        if added == 0 {
            return Ok(false);
        }
        let participant = Participant {
            wallet: wallet.to_string(),
            created_at: Utc::now(),
        };
        let data = serde_json::to_string(&participant)?;
        let _: Option<String> = redis::cmd("SET")
            .arg(participant_key(wallet))
            .arg(data)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(true)
    }

    pub async fn participant_count(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("SCARD").arg(PARTICIPANTS).query_async(&mut conn).await?)
    }

    /// Newest records first.
    pub async fn latest_winners(&self, limit: usize) -> Result<Vec<WinnerRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(WINNERS)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;
        raw.iter().map(|r| serde_json::from_str(r).map_err(Error::from)).collect()
    }
}

impl RaffleStore for Db {
    async fn get_active_raffle(&self, raffle_id: u64) -> Result<Option<Raffle>> {
        Ok(self.get_raffle(raffle_id).await?.filter(|r| r.is_active))
    }
}

impl ParticipantRegistry for Db {
    async fn get_random_participant(&self) -> Result<Option<Participant>> {
        let mut conn = self.conn.clone();
        let wallet: Option<String> = redis::cmd("SRANDMEMBER").arg(PARTICIPANTS).query_async(&mut conn).await?;
        let wallet = match wallet {
            Some(w) => w,
            None => return Ok(None),
        };
        let raw: Option<String> = redis::cmd("GET").arg(participant_key(&wallet)).query_async(&mut conn).await?;
        let participant = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            // registered before creation times were kept
            None => Participant {
                wallet,
                created_at: Utc::now(),
            },
        };
        Ok(Some(participant))
    }
}

impl WinnerLedger for Db {
    async fn next_winner_id(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("INCR").arg(WINNERS_SEQ).query_async(&mut conn).await?)
    }

    async fn put_winner(&self, record: &WinnerRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(record)?;
        let stored: i64 = redis::Script::new(PUT_WINNER)
            .key(winner_key(record.id))
            .key(WINNERS)
            .arg(data)
            .invoke_async(&mut conn)
            .await?;
        if stored == 0 {
            debug!("winner record #{} was already stored", record.id);
        }
        Ok(())
    }
}
