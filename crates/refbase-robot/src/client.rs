// SPDX-License-Identifier: MIT OR Apache-2.0
//! The dispatch client: signed requests to robot endpoints.

use crate::signature::sign_request;
use chrono::Utc;
use refbase_core::wire::{BatchRobotRequestWire, SingleRobotRequestWire};
use refbase_core::Robot;
use refbase_error::{RepoError, RepoResult};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client for robot endpoints with explicit timeouts and the
/// transient/permanent error split.
pub struct RobotClient {
    http: reqwest::Client,
}

impl RobotClient {
    /// Create a client with the given request timeout.
    pub fn new(timeout: Duration) -> RepoResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RepoError::internal(format!("building http client: {e}")))?;
        Ok(Self { http })
    }

    /// `POST /batch/` — hand a robot a batched lease.
    pub async fn dispatch_batch(
        &self,
        robot: &Robot,
        request: &BatchRobotRequestWire,
    ) -> RepoResult<()> {
        let body = serde_json::to_vec(request).map_err(|e| {
            RepoError::internal(format!("serializing batch robot request: {e}"))
        })?;
        self.post(robot, "/batch/", body).await
    }

    /// `POST /single/` — request a single-reference enhancement.
    pub async fn dispatch_single(
        &self,
        robot: &Robot,
        request: &SingleRobotRequestWire,
    ) -> RepoResult<()> {
        let body = serde_json::to_vec(request).map_err(|e| {
            RepoError::internal(format!("serializing single robot request: {e}"))
        })?;
        self.post(robot, "/single/", body).await
    }

    async fn post(&self, robot: &Robot, endpoint: &str, body: Vec<u8>) -> RepoResult<()> {
        let url = format!("{}{}", robot.base_url.trim_end_matches('/'), endpoint);
        let timestamp = Utc::now().timestamp();
        let signature = sign_request(robot.client_secret.expose(), timestamp, &body);

        debug!(
            target: "refbase.robot.client",
            robot = %robot.name,
            endpoint,
            "dispatching request"
        );
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Signature {signature}"))
            .header("X-Client-Id", robot.id.to_string())
            .header("X-Request-Timestamp", timestamp.to_string())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| RepoError::RobotUnreachable {
                detail: format!("cannot reach robot {}: {e}", robot.id),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if status.is_server_error() {
            warn!(
                target: "refbase.robot.client",
                robot = %robot.name,
                status = status.as_u16(),
                "robot answered 5xx"
            );
            return Err(RepoError::RobotUnreachable {
                detail: format!("robot {} answered {status}", robot.id),
            });
        }
        // Anything else is treated as a permanent rejection carrying the
        // robot's response text.
        let text = response.text().await.unwrap_or_default();
        Err(RepoError::RobotEnhancement { detail: text })
    }
}
