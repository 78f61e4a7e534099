//! HTTP server and API endpoints for the faucet server.
//!
//! Claim handlers compose the pipeline: admission control, captcha
//! verification, then one or two transfers. The admission reservation is
//! committed only on a fully successful response; any earlier failure
//! drops it and the client may retry immediately.

use crate::{
    captcha::CaptchaVerifier,
    config::FaucetConfig,
    error::{FaucetError, FaucetResult},
    eth::{eth_to_wei, TransferKind, TxSender},
    limiter::{client_key, Limiter, Reservation},
};
use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Header carrying the user's captcha token.
const CAPTCHA_TOKEN_HEADER: &str = "h-captcha-response";

/// Shared application state
#[derive(Debug, Clone)]
pub struct SharedState {
    pub tx_sender: Arc<TxSender>,
    pub limiter: Arc<Limiter>,
    pub captcha: Arc<CaptchaVerifier>,
    pub config: Arc<FaucetConfig>,
}

impl SharedState {
    fn gateway_deadline(&self) -> Duration {
        Duration::from_secs(self.config.ethereum.request_timeout_secs)
    }
}

/// Claim request body
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub address: String,
}

/// Claim response body
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub message: String,
}

/// Faucet metadata served to the frontend
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub account: String,
    pub network: String,
    pub symbol: String,
    pub payout: String,
    pub hcaptcha_sitekey: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub gateway_connected: bool,
    pub active_rate_limits: usize,
}

/// Create the HTTP router with all endpoints
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/claim", post(claim))
        .route("/api/claim_eth_with_token", post(claim_eth_with_token))
        .route("/api/info", get(info_handler))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Token-only payout.
async fn claim(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ClaimRequest>,
) -> FaucetResult<Json<ClaimResponse>> {
    let reservation = admit(&state, &headers, peer)?;
    verify_captcha(&state, &headers).await?;

    let amount = eth_to_wei(state.config.faucet.token_payout_eth);
    let token_tx_hash = with_deadline(
        state.gateway_deadline(),
        TransferKind::Token,
        state.tx_sender.transfer_token(&request.address, amount),
    )
    .await?;

    reservation.commit();
    info!(%token_tx_hash, address = %request.address, "transaction sent successfully");

    Ok(Json(ClaimResponse {
        message: format!("TokenTxhash: {}", token_tx_hash),
    }))
}

/// Native plus token payout; two independent transfers, two nonces.
async fn claim_eth_with_token(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ClaimRequest>,
) -> FaucetResult<Json<ClaimResponse>> {
    let reservation = admit(&state, &headers, peer)?;
    verify_captcha(&state, &headers).await?;

    let native_amount = eth_to_wei(state.config.faucet.native_payout_eth);
    let tx_hash = with_deadline(
        state.gateway_deadline(),
        TransferKind::Native,
        state.tx_sender.transfer_native(&request.address, native_amount),
    )
    .await?;

    let token_amount = eth_to_wei(state.config.faucet.token_payout_eth);
    let token_tx_hash = match with_deadline(
        state.gateway_deadline(),
        TransferKind::Token,
        state.tx_sender.transfer_token(&request.address, token_amount),
    )
    .await
    {
        Ok(hash) => hash,
        Err(e) => {
            // Partial success: the native leg went out, the token leg did
            // not. Report both facts; the reservation is dropped so the
            // client may retry.
            warn!(%tx_hash, address = %request.address, error = %e, "token leg failed after native transfer");
            return Err(FaucetError::Transfer {
                kind: TransferKind::Token,
                reason: format!("native transfer {} succeeded, but: {}", tx_hash, e),
            });
        }
    };

    reservation.commit();
    info!(%tx_hash, %token_tx_hash, address = %request.address, "transaction sent successfully");

    Ok(Json(ClaimResponse {
        message: format!("Txhash: {}, TokenTxhash: {}", tx_hash, token_tx_hash),
    }))
}

async fn info_handler(State(state): State<SharedState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        account: state.tx_sender.sender().to_string(),
        network: state.config.faucet.network.clone(),
        symbol: state.config.faucet.symbol.clone(),
        payout: state.config.faucet.native_payout_eth.to_string(),
        hcaptcha_sitekey: state.captcha.site_key().to_string(),
    })
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let gateway_connected = state.tx_sender.gateway_reachable().await;
    let status = if gateway_connected { "healthy" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        gateway_connected,
        active_rate_limits: state.limiter.active_entries(),
    })
}

/// Derive the client key and take a rate-limit reservation, failing
/// closed when no client address can be determined.
fn admit(state: &SharedState, headers: &HeaderMap, peer: SocketAddr) -> FaucetResult<Reservation> {
    let key = client_key(headers, Some(peer)).ok_or(FaucetError::ClientUnidentified)?;
    state
        .limiter
        .try_admit(&key)
        .map_err(|retry_after| FaucetError::RateLimited { retry_after })
}

async fn verify_captcha(state: &SharedState, headers: &HeaderMap) -> FaucetResult<()> {
    let token = headers
        .get(CAPTCHA_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    state.captcha.verify(token).await
}

/// Bound an issuer call by the configured per-request deadline. A nonce
/// consumed by a timed-out call is not returned to the pool; the network
/// may still have delivered the transaction.
async fn with_deadline<T>(
    deadline: Duration,
    kind: TransferKind,
    call: impl Future<Output = FaucetResult<T>>,
) -> FaucetResult<T> {
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| FaucetError::Transfer {
            kind,
            reason: format!("gateway call exceeded the {}s deadline", deadline.as_secs()),
        })?
}

/// Start the HTTP server
pub async fn start_server(config: FaucetConfig) -> FaucetResult<()> {
    let config = Arc::new(config);

    let tx_sender = Arc::new(TxSender::new(&config.ethereum).await?);
    info!(address = %tx_sender.sender(), "faucet account loaded");

    let limiter = Arc::new(Limiter::new(Duration::from_secs(
        config.rate_limit.window_minutes * 60,
    )));
    let captcha = Arc::new(CaptchaVerifier::new(&config.captcha)?);
    if !captcha.is_enabled() {
        warn!("captcha secret is empty, verification disabled");
    }

    // Periodically drop expired rate-limit entries.
    let purge_limiter = Arc::clone(&limiter);
    let purge_interval = config.rate_limit.purge_interval_minutes.max(1);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(purge_interval * 60));
        loop {
            interval.tick().await;
            purge_limiter.purge_expired();
        }
    });

    let state = SharedState {
        tx_sender,
        limiter,
        captcha,
        config: Arc::clone(&config),
    };
    let app = create_router(state);

    let bind_addr = format!("{}:{}", config.http.bind_address, config.http.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| FaucetError::Internal(anyhow::anyhow!("Failed to bind to {}: {}", bind_addr, e)))?;

    info!("faucet server listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| FaucetError::Internal(anyhow::anyhow!("Server error: {}", e)))?;

    Ok(())
}
