// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The robot wire contract.
//!
//! Every request to a robot is signed: `Authorization: Signature <hex>`,
//! `X-Client-Id: <uuid>`, `X-Request-Timestamp: <unix>`, where the signature
//! is HMAC-SHA256 over `<timestamp>.<body>` keyed by the robot's secret.
//! Verification allows ±5 minutes of clock skew. A robot answers 202 to
//! accept; any 4xx is a permanent rejection, any 5xx (or transport failure)
//! is transient.

mod client;
mod signature;

pub use client::RobotClient;
pub use signature::{sign_request, verify_request, SIGNATURE_SKEW_SECONDS};
