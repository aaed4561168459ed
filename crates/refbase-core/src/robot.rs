// SPDX-License-Identifier: MIT OR Apache-2.0
//! Robots and their automations.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// A robot's shared signing key.
///
/// Redacted in `Debug` and serialized output; the raw value is only reachable
/// via [`ClientSecret::expose`], which the signing code and the one-shot
/// provisioning response use.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecret(String);

impl ClientSecret {
    /// Wrap a raw secret.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientSecret(****)")
    }
}

impl Serialize for ClientSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("****")
    }
}

/// An out-of-process enhancement worker.
///
/// Uniqueness is on `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    /// Row id, doubling as the HMAC client id.
    pub id: Uuid,
    /// Unique robot name.
    pub name: String,
    /// Base URL the robot serves its endpoints on.
    pub base_url: String,
    /// What the robot does.
    pub description: String,
    /// Who operates the robot.
    pub owner: String,
    /// Shared signing key.
    pub client_secret: ClientSecret,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Robot {
    /// Register a robot with a caller-provided secret.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        description: impl Into<String>,
        owner: impl Into<String>,
        client_secret: ClientSecret,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            base_url: base_url.into(),
            description: description.into(),
            owner: owner.into(),
            client_secret,
            created_at: Utc::now(),
        }
    }
}

/// A stored percolation query that triggers work for a robot.
///
/// The query is a structured JSON DSL evaluated against
/// `{reference, changeset}` documents on every reference change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RobotAutomation {
    /// Row id, doubling as the percolation-query document id.
    pub id: Uuid,
    /// The robot to trigger on a match.
    pub robot_id: Uuid,
    /// The percolation query.
    pub query: serde_json::Value,
}

impl RobotAutomation {
    /// Register an automation for a robot.
    #[must_use]
    pub fn new(robot_id: Uuid, query: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            robot_id,
            query,
        }
    }
}
