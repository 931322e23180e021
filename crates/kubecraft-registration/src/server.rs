//! Registration HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use kubecraft_common::Error;
use kubecraft_provisioner::TenantProvisioner;

/// Body of `POST /register`
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Requested tenant name
    #[serde(rename = "tenantName", alias = "username")]
    pub tenant_name: String,
}

/// Body of every `POST /register` response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RegisterResponse {
    /// Tenant registered
    Success {
        /// Registered tenant name
        #[serde(rename = "tenantName")]
        tenant_name: String,
        /// Bearer credential of the tenant identity
        token: String,
    },
    /// Registration failed
    Error {
        /// What went wrong
        message: String,
    },
}

/// An error on its way to the client
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self {
            status: StatusCode::from_u16(e.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(RegisterResponse::Error {
                message: self.message,
            }),
        )
            .into_response()
    }
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Tenant onboarding
    pub provisioner: Arc<TenantProvisioner>,
}

/// Build the registration router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/register", post(register_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

async fn register_handler(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| {
        warn!(error = %e, "Rejected registration body");
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "invalid JSON format".to_string(),
        }
    })?;

    let registration = state
        .provisioner
        .register(&request.tenant_name)
        .await
        .inspect_err(|e| warn!(tenant = %request.tenant_name, error = %e, "Registration failed"))?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse::Success {
            tenant_name: registration.tenant,
            token: registration.token.expose_secret().to_string(),
        }),
    ))
}

/// Serve until Ctrl-C or SIGTERM
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Registration server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
