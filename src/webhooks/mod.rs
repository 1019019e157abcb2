//! Payment gateway webhook normalization.
//!
//! Each gateway posts its own payload shape. They are reduced to a [`NormalizedWebhook`] carrying
//! the gateway's transaction reference and a `success`/`failed` outcome before the payment
//! service looks anything up. Signatures are not checked here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::entities::PaymentStatus;
use crate::errors::ServiceError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PaymentGateway {
    Vnpay,
    Momo,
    Zalopay,
}

/// Gateway-independent view of a webhook call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedWebhook {
    pub gateway: PaymentGateway,
    pub transaction_id: String,
    /// `success` or `failed`.
    pub status: String,
    pub message: Option<String>,
    /// Payload exactly as received, stored as the payment's gateway response.
    pub raw: Value,
}

impl NormalizedWebhook {
    pub fn payment_status(&self) -> PaymentStatus {
        map_status(&self.status)
    }
}

/// Maps a normalized outcome onto the payment lifecycle. Anything unrecognised stays pending.
pub fn map_status(status: &str) -> PaymentStatus {
    match status.to_ascii_lowercase().as_str() {
        "success" | "completed" => PaymentStatus::Paid,
        "failed" | "error" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

pub fn normalize(gateway: &str, payload: &Value) -> Result<NormalizedWebhook, ServiceError> {
    let gateway = PaymentGateway::from_str(gateway).map_err(|_| {
        ServiceError::ValidationError(format!("Unsupported payment gateway: {}", gateway))
    })?;

    let (transaction_id, success, message) = match gateway {
        PaymentGateway::Vnpay => (
            required_str(payload, "vnp_TxnRef")?,
            text_field(payload, "vnp_ResponseCode").as_deref() == Some("00"),
            text_field(payload, "vnp_Message"),
        ),
        PaymentGateway::Momo => (
            required_str(payload, "orderId")?,
            int_field(payload, "resultCode") == Some(0),
            text_field(payload, "message"),
        ),
        PaymentGateway::Zalopay => (
            required_str(payload, "apptransid")?,
            int_field(payload, "status") == Some(1),
            None,
        ),
    };

    Ok(NormalizedWebhook {
        gateway,
        transaction_id,
        status: if success { "success" } else { "failed" }.to_string(),
        message,
        raw: payload.clone(),
    })
}

fn required_str(payload: &Value, field: &str) -> Result<String, ServiceError> {
    text_field(payload, field)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::ValidationError(format!("Webhook is missing {}", field)))
}

// Gateways are inconsistent about quoting, so numbers and strings are both accepted.
fn text_field(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(payload: &Value, field: &str) -> Option<i64> {
    match payload.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
