use axum::{
    Router,
    routing::{get, post},
    response::{IntoResponse, Response},
    extract::{
        ws::{WebSocket, WebSocketUpgrade, Message},
        ConnectInfo, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use anyhow::Result;
use tokio::sync::broadcast;

use crate::chat::ChatStore;
use crate::config::Config;
use crate::courts::CourtDirectory;
use crate::error::JamError;
use crate::identity::{IdentityClient, Subject};
use crate::ledger::CheckInLedger;
use crate::metrics::Metrics;
use crate::protocol::{
    AdminResetRequest, AdminResetResponse, ChatClientFrame, ChatServerFrame, CheckInResponse,
    CheckOutResponse, CourtListResponse, ErrorBody, ErrorCode, MessagesResponse, RatingRequest,
    RatingResponse, ResetMode, StatsResponse, VerifyResponse,
};
use crate::ratelimit::ActionLimits;
use crate::sanitize;

#[derive(Clone)]
pub struct AppState {
    pub courts: Arc<CourtDirectory>,
    pub ledger: Arc<CheckInLedger>,
    pub chat: Arc<ChatStore>,
    pub limits: Arc<ActionLimits>,
    pub identity: Arc<IdentityClient>,
    pub metrics: Arc<Metrics>,
    pub config: Config,
    pub started_at: Instant,
}

impl IntoResponse for JamError {
    fn into_response(self) -> Response {
        let status = match &self {
            JamError::Validation(_) => StatusCode::BAD_REQUEST,
            JamError::Identity(_) => StatusCode::UNAUTHORIZED,
            JamError::UnknownCourt(_) => StatusCode::NOT_FOUND,
            JamError::Duplicate(_) => StatusCode::CONFLICT,
            JamError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            JamError::Storage(_) | JamError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::from_error(&self))).into_response()
    }
}

pub async fn run(
    config: Config,
    courts: Arc<CourtDirectory>,
    ledger: Arc<CheckInLedger>,
    chat: Arc<ChatStore>,
    limits: Arc<ActionLimits>,
    identity: Arc<IdentityClient>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let state = AppState {
        courts, ledger, chat, limits, identity, metrics,
        config: config.clone(),
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats_handler))
        .route("/api/auth/verify", post(verify_auth))
        .route("/api/courts", get(list_courts))
        .route("/api/courts/:id", get(get_court))
        .route("/api/courts/:id/checkin", post(check_in))
        .route("/api/courts/:id/checkout", post(check_out))
        .route("/api/courts/:id/rating", post(submit_rating))
        .route("/api/courts/:id/messages", get(court_messages))
        .route("/ws/courts/:id", get(ws_chat))
        .route("/api/admin/reset", post(admin_reset))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let addr: SocketAddr = config.server.bind_addr.parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        courts: state.courts.count(),
        active_checkins: state.ledger.total_active(),
        cached_messages: state.chat.message_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// A bearer token resolves through the identity provider; the `X-Nickname`
/// header resolves to a guest subject. Anything else is unauthorized.
async fn resolve_subject(state: &AppState, headers: &HeaderMap) -> Result<Subject, JamError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let raw = value
            .to_str()
            .map_err(|_| JamError::Identity("malformed authorization header".to_string()))?;
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
        if token.is_empty() {
            return Err(JamError::Identity("empty bearer token".to_string()));
        }
        return verified_subject(state, token).await;
    }

    if let Some(value) = headers.get("x-nickname") {
        let raw = value
            .to_str()
            .map_err(|_| JamError::Validation("malformed nickname header".to_string()))?;
        return guest_subject(raw);
    }

    Err(JamError::Identity(
        "missing Authorization or X-Nickname header".to_string(),
    ))
}

async fn verified_subject(state: &AppState, token: &str) -> Result<Subject, JamError> {
    match state.identity.verify(token).await {
        Ok(mut subject) => {
            // provider nicknames go through the same cleanup as guest ones
            subject.display_name = sanitize::nickname(&subject.display_name)
                .unwrap_or_else(|_| "player".to_string());
            Ok(subject)
        }
        Err(e) => {
            state.metrics.inc_identity_failures();
            Err(e.into())
        }
    }
}

fn guest_subject(raw: &str) -> Result<Subject, JamError> {
    let display_name = sanitize::nickname(raw)?;
    let id = sanitize::subject_id(raw)?;
    Ok(Subject {
        id,
        display_name,
        authenticated: false,
    })
}

fn observe_rejection(state: &AppState, e: &JamError) {
    match e {
        JamError::Duplicate(_) => state.metrics.inc_duplicates(),
        JamError::RateLimit { .. } => state.metrics.inc_rate_limits(),
        _ => {}
    }
}

async fn verify_auth(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<VerifyResponse>, JamError> {
    // login attempts are throttled per client address
    if let Err(e) = state.limits.login.check(&addr.ip().to_string()) {
        state.metrics.inc_rate_limits();
        return Err(e);
    }

    let subject = resolve_subject(&state, &headers).await?;
    Ok(Json(VerifyResponse {
        subject_id: subject.id,
        display_name: subject.display_name,
        authenticated: subject.authenticated,
    }))
}

async fn list_courts(State(state): State<AppState>) -> impl IntoResponse {
    Json(CourtListResponse {
        courts: state.courts.list(),
    })
}

async fn get_court(
    State(state): State<AppState>,
    Path(court_id): Path<String>,
) -> Result<impl IntoResponse, JamError> {
    state
        .courts
        .get(&court_id)
        .map(Json)
        .ok_or(JamError::UnknownCourt(court_id))
}

async fn check_in(
    State(state): State<AppState>,
    Path(court_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CheckInResponse>, JamError> {
    let subject = resolve_subject(&state, &headers).await?;

    let record = match state.ledger.check_in(
        &state.courts,
        &state.limits.checkin,
        &court_id,
        &subject.id,
        &subject.display_name,
    ) {
        Ok(record) => record,
        Err(e) => {
            observe_rejection(&state, &e);
            return Err(e);
        }
    };
    state.metrics.inc_checkins();

    let court = state
        .courts
        .get(&court_id)
        .ok_or_else(|| JamError::UnknownCourt(court_id.clone()))?;
    info!("{} checked in at court {}", record.display_name, court_id);

    Ok(Json(CheckInResponse {
        court_id: record.court_id,
        subject_id: record.subject_id,
        display_name: record.display_name,
        timestamp_ms: record.timestamp_ms,
        current_players: court.current_players,
        total_checkins: court.total_checkins,
    }))
}

async fn check_out(
    State(state): State<AppState>,
    Path(court_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CheckOutResponse>, JamError> {
    let subject = resolve_subject(&state, &headers).await?;

    match state.ledger.check_out(&state.courts, &court_id, &subject.id) {
        Ok(current_players) => {
            state.metrics.inc_checkouts();
            info!("{} checked out of court {}", subject.display_name, court_id);
            Ok(Json(CheckOutResponse {
                court_id,
                subject_id: subject.id,
                current_players,
            }))
        }
        Err(e) => {
            observe_rejection(&state, &e);
            Err(e)
        }
    }
}

async fn submit_rating(
    State(state): State<AppState>,
    Path(court_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RatingRequest>,
) -> Result<Json<RatingResponse>, JamError> {
    let subject = resolve_subject(&state, &headers).await?;
    if !subject.authenticated {
        return Err(JamError::Identity(
            "rating requires a signed-in account".to_string(),
        ));
    }
    if !(1..=5).contains(&request.stars) {
        return Err(JamError::Validation(
            "stars must be between 1 and 5".to_string(),
        ));
    }
    if !state.courts.contains(&court_id) {
        return Err(JamError::UnknownCourt(court_id));
    }
    // repeat raters are turned away before an attempt is spent
    if state.courts.has_rated(&court_id, &subject.id) {
        state.metrics.inc_duplicates();
        return Err(JamError::Duplicate(format!(
            "{} already rated court {}",
            subject.id, court_id
        )));
    }
    if let Err(e) = state.limits.rating.check(&subject.id) {
        state.metrics.inc_rate_limits();
        return Err(e);
    }

    let (rating, rating_count) = match state.courts.rate(&court_id, &subject.id, request.stars) {
        Ok(v) => v,
        Err(e) => {
            observe_rejection(&state, &e);
            return Err(e);
        }
    };
    state.metrics.inc_ratings();

    Ok(Json(RatingResponse {
        court_id,
        rating,
        rating_count,
    }))
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

async fn court_messages(
    State(state): State<AppState>,
    Path(court_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, JamError> {
    if !state.courts.contains(&court_id) {
        return Err(JamError::UnknownCourt(court_id));
    }
    let mut messages = state.chat.recent(&court_id);
    if let Some(limit) = query.limit {
        // keep the newest messages, oldest first
        let skip = messages.len().saturating_sub(limit);
        messages.drain(..skip);
    }
    Ok(Json(MessagesResponse { court_id, messages }))
}

#[derive(Deserialize)]
struct ChatQuery {
    token: Option<String>,
    nickname: Option<String>,
}

async fn ws_chat(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(court_id): Path<String>,
    Query(query): Query<ChatQuery>,
) -> Response {
    if !state.courts.contains(&court_id) {
        return JamError::UnknownCourt(court_id).into_response();
    }

    let subject = match resolve_ws_subject(&state, &query).await {
        Ok(subject) => subject,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, court_id, subject))
}

async fn resolve_ws_subject(state: &AppState, query: &ChatQuery) -> Result<Subject, JamError> {
    if let Some(token) = query.token.as_deref() {
        let token = token.trim();
        if !token.is_empty() {
            return verified_subject(state, token).await;
        }
    }
    if let Some(raw) = query.nickname.as_deref() {
        return guest_subject(raw);
    }
    Err(JamError::Identity(
        "missing token or nickname query parameter".to_string(),
    ))
}

async fn handle_chat_socket(
    mut socket: WebSocket,
    state: AppState,
    court_id: String,
    subject: Subject,
) {
    state.metrics.inc_ws_connections();
    info!("{} joined court {} chat", subject.display_name, court_id);

    let mut rx = state.chat.subscribe(&court_id);

    // a message posted while the greeting is assembled arrives on the
    // channel too; the id set keeps it to a single delivery
    let messages = state.chat.recent(&court_id);
    let mut greeted: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
    let history = ChatServerFrame::History { messages };
    if socket
        .send(Message::Text(serde_json::to_string(&history).unwrap()))
        .await
        .is_err()
    {
        state.metrics.dec_ws_connections();
        return;
    }

    loop {
        tokio::select! {
            delivered = rx.recv() => {
                match delivered {
                    Ok(message) => {
                        if greeted.remove(&message.id) {
                            continue;
                        }
                        let frame = ChatServerFrame::Message { message };
                        if socket.send(Message::Text(serde_json::to_string(&frame).unwrap())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Chat subscriber for court {} lagged by {} messages", court_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ChatClientFrame>(&text) {
                            Ok(ChatClientFrame::Post { text }) => {
                                match state.chat.post(
                                    &state.limits.chat_message,
                                    &court_id,
                                    &subject.id,
                                    &subject.display_name,
                                    &text,
                                ) {
                                    // the poster hears it back through the broadcast
                                    Ok(_) => state.metrics.inc_messages(),
                                    Err(e) => {
                                        observe_rejection(&state, &e);
                                        let frame = ChatServerFrame::error(&e);
                                        if socket.send(Message::Text(serde_json::to_string(&frame).unwrap())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Ok(ChatClientFrame::Ping) => {
                                if socket.send(Message::Text(serde_json::to_string(&ChatServerFrame::Pong).unwrap())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Invalid chat frame: {}", e);
                                let frame = ChatServerFrame::error(&JamError::Validation(
                                    "invalid frame".to_string(),
                                ));
                                let _ = socket.send(Message::Text(serde_json::to_string(&frame).unwrap())).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.metrics.dec_ws_connections();
    info!("{} left court {} chat", subject.display_name, court_id);
}

async fn admin_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AdminResetRequest>,
) -> Response {
    let Some(expected) = state.config.server.admin_token.as_deref() else {
        return forbidden("admin interface is disabled");
    };
    let provided = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || provided != expected {
        return forbidden("bad admin token");
    }

    match request.mode {
        ResetMode::Daily => {
            state.ledger.reset_daily(&state.courts);
            state.metrics.inc_daily_resets();
        }
        ResetMode::All => {
            state.ledger.reset_all(&state.courts);
        }
        ResetMode::Restore => {
            if let Err(e) = state.courts.restore_defaults() {
                return e.into_response();
            }
            state.ledger.reset_daily(&state.courts);
        }
    }
    info!("Administrative reset performed: {:?}", request.mode);

    Json(AdminResetResponse {
        mode: request.mode,
        courts: state.courts.count(),
    })
    .into_response()
}

fn forbidden(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorBody {
            code: ErrorCode::Forbidden,
            message: message.to_string(),
            retry_after_ms: None,
        }),
    )
        .into_response()
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("Failed to install signal handler");
    info!("Shutdown signal received");
}
