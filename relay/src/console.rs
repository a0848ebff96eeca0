//! Admin endpoints for inspecting and hot-swapping the allow-list.
//!
//! `GET /config/get` returns the active table; `POST`/`PUT
//! /config/update` replaces it and persists the result when a rules file
//! is configured.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use snirelay_shared::rules::RuleSet;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::normalize_listen;

#[derive(Clone)]
struct ConsoleState {
    rules: Arc<RuleSet>,
    rules_path: Option<PathBuf>,
}

pub struct Console {
    state: ConsoleState,
    listen: String,
}

impl Console {
    pub fn new(rules: Arc<RuleSet>, rules_path: Option<PathBuf>, listen: String) -> Self {
        Self {
            state: ConsoleState { rules, rules_path },
            listen,
        }
    }

    pub async fn start(self) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(normalize_listen(&self.listen))
            .await
            .with_context(|| format!("unable to listen on {}", self.listen))?;
        info!("admin console at {}", self.listen);
        Ok(tokio::spawn(serve_on(listener, self.state)))
    }
}

async fn serve_on(listener: TcpListener, state: ConsoleState) {
    let app = Router::new()
        .route("/config/get", get(get_config))
        .route("/config/update", post(update_config).put(update_config))
        .with_state(state);
    if let Err(e) = axum::serve(listener, app).await {
        warn!("console server exited: {e}");
    }
}

async fn get_config(State(state): State<ConsoleState>) -> String {
    state.rules.to_json()
}

async fn update_config(
    State(state): State<ConsoleState>,
    body: Bytes,
) -> (StatusCode, String) {
    if let Err(e) = state.rules.put_json(&body).await {
        warn!("unable to set host config: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("set hosts config error: {e}"),
        );
    }
    if let Some(path) = &state.rules_path {
        if let Err(e) = save_rules(&state.rules, path).await {
            warn!("save config failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("save config error: {e}"),
            );
        }
    }
    info!("config updated and saved successfully");
    (StatusCode::OK, "ok".to_string())
}

/// Persist the active table to `path` in the same JSON shape served by
/// `/config/get`. The file holds server policy, so it is written private
/// to the owner.
pub async fn save_rules(rules: &RuleSet, path: &Path) -> std::io::Result<()> {
    tokio::fs::write(path, rules.to_json()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(rules_path: Option<PathBuf>) -> ConsoleState {
        ConsoleState {
            rules: Arc::new(RuleSet::new(false)),
            rules_path,
        }
    }

    #[tokio::test]
    async fn update_then_get_round_trips() {
        let state = state(None);
        let (status, body) = update_config(
            State(state.clone()),
            Bytes::from_static(br#"{"Example.COM": ""}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
        assert!(state.rules.is_host_allowed("a.example.com"));

        let json = get_config(State(state)).await;
        assert!(json.contains("example.com"));
    }

    #[tokio::test]
    async fn malformed_body_returns_500() {
        let state = state(None);
        let (status, body) =
            update_config(State(state), Bytes::from_static(b"not json")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("set hosts config error"));
    }

    #[tokio::test]
    async fn update_persists_to_the_rules_file() {
        let path = std::env::temp_dir().join(format!(
            "snirelay-rules-{}.json",
            std::process::id()
        ));
        let state = state(Some(path.clone()));
        let (status, _) = update_config(
            State(state),
            Bytes::from_static(br#"{"example.com": ""}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("example.com"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
