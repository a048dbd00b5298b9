use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Debug, Display},
    sync::Mutex,
    time::{Duration, Instant},
};

use actix_web::{
    body::BoxBody, error, http::StatusCode, web, App, Error, HttpRequest, HttpResponse, HttpServer, Responder,
    ResponseError,
};
use distributor::{config::Config, db::Db, model::WinnerRecord, utils};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

const RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";
const MAX_REQUESTS_PER_WINDOW: usize = 5;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_WINNERS: usize = 5;
const MAX_WINNERS: usize = 100;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiResult<T = ()> {
    pub code: i32,
    pub msg: Option<Cow<'static, str>>,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResult<T> {
    pub fn new() -> Self {
        Self {
            code: 200,
            msg: None,
            data: None,
        }
    }
    pub fn code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }
    pub fn with_msg<S: Into<Cow<'static, str>>>(mut self, msg: S) -> Self {
        self.msg = Some(msg.into());
        self
    }
    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }
    pub fn log_to_resp(&self, req: &HttpRequest) -> HttpResponse {
        self.log(req);
        self.to_resp()
    }
    pub fn log(&self, req: &HttpRequest) {
        info!(
            "{} \"{} {} {:?}\" {}",
            client_ip(req),
            req.method(),
            req.uri(),
            req.version(),
            self.code
        );
    }
    pub fn to_resp(&self) -> HttpResponse {
        match serde_json::to_string(self) {
            Ok(json) => HttpResponse::Ok().content_type("application/json").body(json),
            Err(e) => Error::from(e).into(),
        }
    }
}

impl<T: Debug + Serialize> Display for ApiResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl<T: Debug + Serialize> ResponseError for ApiResult<T> {
    fn status_code(&self) -> StatusCode {
        StatusCode::OK
    }
    fn error_response(&self) -> HttpResponse {
        self.to_resp()
    }
}

impl<T: Serialize> Responder for ApiResult<T> {
    type Body = BoxBody;

    fn respond_to(self, req: &HttpRequest) -> HttpResponse {
        self.log_to_resp(req)
    }
}

// return 200 all
pub fn json_error_handler<E: std::fmt::Display + std::fmt::Debug + 'static>(err: E, req: &HttpRequest) -> error::Error {
    let detail = err.to_string();
    let api = ApiResult::new().with_data(()).code(400).with_msg(detail);
    let response = api.log_to_resp(req);

    error::InternalError::from_response(err, response).into()
}

pub async fn notfound(req: HttpRequest) -> Result<HttpResponse, Error> {
    let api = ApiResult::new().with_data(()).code(404).with_msg("route not found");

    Ok(api.respond_to(&req))
}

fn client_ip(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Sliding window request counter keyed by client ip.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records a hit for `key` at `now`; false once the window is full.
    pub fn check(&self, key: &str, now: Instant) -> bool {
        let mut hits = match self.hits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = self.window;
        // forget clients whose hits all fell out of the window
        hits.retain(|_, stamps| {
            stamps.retain(|t| now.duration_since(*t) < window);
            !stamps.is_empty()
        });
        let stamps = hits.entry(key.to_string()).or_default();
        if stamps.len() >= self.max {
            return false;
        }
        stamps.push(now);
        true
    }

    /// Number of clients with hits inside the current window.
    pub fn tracked(&self) -> usize {
        match self.hits.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Google reCAPTCHA v2 check. Without a secret every request passes.
pub struct Recaptcha {
    secret: Option<String>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SiteVerify {
    #[serde(default)]
    success: bool,
}

impl Recaptcha {
    pub fn new(secret: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            http,
        }
    }

    pub fn enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub async fn verify(&self, token: &str, remote_ip: Option<&str>) -> bool {
        let secret = match &self.secret {
            Some(secret) => secret,
            None => return true,
        };
        if token.is_empty() {
            return false;
        }
        let mut form = vec![("secret", secret.as_str()), ("response", token)];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }
        let res = async {
            let out: SiteVerify = self
                .http
                .post(RECAPTCHA_VERIFY_URL)
                .form(&form)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok::<_, reqwest::Error>(out.success)
        }
        .await;
        // an unreachable captcha server must not let bots through
        res.unwrap_or_else(|e| {
            warn!("recaptcha verification failed: {}", e);
            false
        })
    }
}

pub struct AppState {
    db: Db,
    recaptcha: Recaptcha,
    limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: &Config, db: Db) -> Self {
        Self {
            db,
            recaptcha: Recaptcha::new(config.recaptcha_secret.clone()),
            limiter: RateLimiter::new(MAX_REQUESTS_PER_WINDOW, RATE_WINDOW),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub wallet: String,
    pub recaptcha_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct WinnerOut {
    pub wallet: String,
    pub amount_sol: f64,
    pub tx_signature: Option<String>,
}

impl From<WinnerRecord> for WinnerOut {
    fn from(w: WinnerRecord) -> Self {
        Self {
            wallet: w.wallet,
            amount_sol: utils::lamports_to_sol(w.amount_lamports),
            tx_signature: w.tx_signature,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub limit: Option<usize>,
}

fn rejected(code: i32, msg: &'static str) -> ApiResult<JoinResponse> {
    ApiResult::new().code(code).with_msg(msg)
}

pub async fn join(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<JoinRequest>,
) -> ApiResult<JoinResponse> {
    let ip = client_ip(&req);
    if !state.limiter.check(&ip, Instant::now()) {
        return rejected(429, "Too many requests, please slow down");
    }

    if state.recaptcha.enabled() {
        let token = match payload.recaptcha_token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => return rejected(400, "Captcha is required."),
        };
        if !state.recaptcha.verify(token, Some(ip.as_str())).await {
            return rejected(400, "Captcha verification failed.");
        }
    }

    let wallet = match utils::parse_wallet(&payload.wallet) {
        Ok(wallet) => wallet.to_string(),
        Err(_) if payload.wallet.trim().is_empty() => return rejected(400, "Wallet address is required."),
        Err(_) => return rejected(400, "Invalid Solana wallet address."),
    };

    match state.db.add_participant(&wallet).await {
        Ok(added) => {
            let message = if added {
                "You have been successfully added to the participants list."
            } else {
                "You are already in the participants list."
            };
            ApiResult::new().with_data(JoinResponse {
                ok: true,
                message: message.to_string(),
            })
        }
        Err(e) => {
            error!("failed to register {}: {}", wallet, e);
            rejected(500, "Registration is temporarily unavailable.")
        }
    }
}

pub async fn latest_winners(state: web::Data<AppState>, query: web::Query<LatestQuery>) -> ApiResult<Vec<WinnerOut>> {
    let limit = query.limit.unwrap_or(DEFAULT_WINNERS).min(MAX_WINNERS);
    match state.db.latest_winners(limit).await {
        Ok(rows) => ApiResult::new().with_data(rows.into_iter().map(WinnerOut::from).collect()),
        Err(e) => {
            error!("failed to list winners: {}", e);
            ApiResult::new().code(500).with_msg("winners are temporarily unavailable")
        }
    }
}

pub async fn serve(config: &Config, db: Db) -> std::io::Result<()> {
    let state = web::Data::new(AppState::new(config, db));
    info!("http service listening on {}", config.http_listen);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .app_data(web::QueryConfig::default().error_handler(json_error_handler))
            .route("/api/participants/join", web::post().to(join))
            .route("/api/winners/latest", web::get().to(latest_winners))
            .default_service(web::route().to(notfound))
    })
    .bind(config.http_listen.as_str())?
    .run()
    .await
}
