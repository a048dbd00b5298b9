use std::fmt::Formatter;

use solana_client::client_error::ClientError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Config(String),
    InvalidKey(String),
    Timeout(String),
    Rpc(Box<ClientError>),
    Tx(TxError),
    Http(reqwest::Error),
    Db(redis::RedisError),
    Json(serde_json::Error),
    Io(std::io::Error),
    NotSupport(String),
    Unknown(String),
}

#[derive(Debug)]
pub enum TxError {
    Build(String),
    Decode(String),
    MissingMeta(String),
    Reconcile(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(e) => write!(f, "invalid configuration: {}", e),
            Error::InvalidKey(e) => write!(f, "invalid key: {}", e),
            Error::Timeout(what) => write!(f, "{} timed out", what),
            Error::Rpc(e) => write!(f, "Rpc error {}", e),
            Error::Tx(e) => write!(f, "Transaction error:: {:?}", e),
            Error::Http(e) => write!(f, "Http error {}", e),
            Error::Db(e) => write!(f, "Database error {}", e),
            Error::Json(e) => write!(f, "Json error {}", e),
            Error::Io(e) => write!(f, "Io error {}", e),
            Error::NotSupport(e) => write!(f, "Not support: {}", e),
            Error::Unknown(e) => write!(f, "a unknown error happened: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Rpc(e) => Some(e.as_ref()),
            Error::Http(e) => Some(e),
            Error::Db(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        Error::Rpc(Box::new(e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Db(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<TxError> for Error {
    fn from(e: TxError) -> Self {
        Error::Tx(e)
    }
}
