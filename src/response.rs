//! Typed views of synchronous webhook responses.
//!
//! Tax and shipping parsers return `Err`/skip entries on malformed input.
//! Payment and transaction parsers always return a result object, carrying
//! the error text when the response was unusable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ResponseError;
use crate::types::AppId;

/// Error text for payment flows whose webhook call produced no usable answer.
pub const FAILED_TO_DELIVER: &str = "Failed to delivery request.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLineData {
    pub total_gross_amount: f64,
    pub total_net_amount: f64,
    pub tax_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxData {
    pub shipping_price_gross_amount: f64,
    pub shipping_price_net_amount: f64,
    pub shipping_tax_rate: f64,
    pub lines: Vec<TaxLineData>,
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, ResponseError> {
    value.as_object().ok_or(ResponseError::NotAnObject)
}

fn amount(object: &Map<String, Value>, field: &str) -> Result<f64, ResponseError> {
    let value = object
        .get(field)
        .and_then(number)
        .ok_or_else(|| ResponseError::InvalidField(field.to_string()))?;
    if value < 0.0 {
        return Err(ResponseError::NegativeAmount(field.to_string()));
    }
    Ok(value)
}

/// Numbers may arrive as JSON numbers or decimal strings.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string(object: &Map<String, Value>, field: &str) -> Option<String> {
    match object.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a tax app answer for an order or checkout with `expected_lines` lines.
pub fn parse_tax_data(value: &Value, expected_lines: usize) -> Result<TaxData, ResponseError> {
    let object = as_object(value)?;
    let lines = object
        .get("lines")
        .and_then(Value::as_array)
        .ok_or_else(|| ResponseError::InvalidField("lines".into()))?;
    if lines.len() != expected_lines {
        return Err(ResponseError::LineCountMismatch {
            expected: expected_lines,
            actual: lines.len(),
        });
    }

    let lines = lines
        .iter()
        .map(|line| {
            let line = as_object(line)?;
            Ok(TaxLineData {
                total_gross_amount: amount(line, "total_gross_amount")?,
                total_net_amount: amount(line, "total_net_amount")?,
                tax_rate: amount(line, "tax_rate")?,
            })
        })
        .collect::<Result<Vec<_>, ResponseError>>()?;

    Ok(TaxData {
        shipping_price_gross_amount: amount(object, "shipping_price_gross_amount")?,
        shipping_price_net_amount: amount(object, "shipping_price_net_amount")?,
        shipping_tax_rate: amount(object, "shipping_tax_rate")?,
        lines,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingMethodData {
    /// `app:<app id>:<method id>`, unique across apps.
    pub id: String,
    pub name: String,
    pub price: f64,
    pub currency: Option<String>,
    pub minimum_delivery_days: Option<u32>,
    pub maximum_delivery_days: Option<u32>,
    pub description: Option<String>,
}

/// Shipping methods offered by one app. Malformed entries are skipped.
pub fn parse_shipping_methods(value: &Value, app_id: &AppId) -> Vec<ShippingMethodData> {
    let Some(entries) = value.as_array() else {
        tracing::warn!(app_id = %app_id, "shipping methods response is not a list");
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let parsed = parse_shipping_method(entry, app_id);
            if let Err(err) = &parsed {
                tracing::warn!(app_id = %app_id, error = %err, "skipping malformed shipping method");
            }
            parsed.ok()
        })
        .collect()
}

fn parse_shipping_method(value: &Value, app_id: &AppId) -> Result<ShippingMethodData, ResponseError> {
    let object = as_object(value)?;
    let id = string(object, "id").ok_or_else(|| ResponseError::InvalidField("id".into()))?;
    let name = string(object, "name").ok_or_else(|| ResponseError::InvalidField("name".into()))?;
    let days = |field: &str| object.get(field).and_then(Value::as_u64).and_then(|d| u32::try_from(d).ok());
    Ok(ShippingMethodData {
        id: format!("app:{}:{}", app_id, id),
        name,
        price: amount(object, "amount")?,
        currency: string(object, "currency"),
        minimum_delivery_days: days("minimum_delivery_days"),
        maximum_delivery_days: days("maximum_delivery_days"),
        description: string(object, "description"),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedShippingMethod {
    pub id: String,
    pub reason: Option<String>,
}

/// Methods an app asks to hide, from `{"excluded_methods": [...]}`.
pub fn parse_excluded_shipping_methods(value: &Value) -> Result<Vec<ExcludedShippingMethod>, ResponseError> {
    let object = as_object(value)?;
    let Some(entries) = object.get("excluded_methods").and_then(Value::as_array) else {
        return Err(ResponseError::InvalidField("excluded_methods".into()));
    };
    Ok(entries
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|entry| {
            Some(ExcludedShippingMethod {
                id: string(entry, "id")?,
                reason: string(entry, "reason"),
            })
        })
        .collect())
}

/// Outcome of a transaction session or process call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionResult {
    /// e.g. `CHARGE_SUCCESS`, `AUTHORIZATION_FAILURE`.
    pub result: Option<String>,
    pub psp_reference: Option<String>,
    pub amount: Option<f64>,
    pub message: Option<String>,
    pub external_url: Option<String>,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl TransactionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

pub fn parse_transaction_response(value: Option<&Value>) -> TransactionResult {
    let Some(object) = value.and_then(Value::as_object) else {
        return TransactionResult::failed(FAILED_TO_DELIVER);
    };
    let Some(result) = string(object, "result").filter(|r| !r.is_empty()) else {
        return TransactionResult {
            data: object.get("data").cloned(),
            ..TransactionResult::failed("Missing or invalid value for `result`.")
        };
    };
    let amount = match object.get("amount") {
        None | Some(Value::Null) => None,
        Some(raw) => match number(raw) {
            Some(value) if value >= 0.0 => Some(value),
            _ => {
                return TransactionResult {
                    result: Some(result),
                    data: object.get("data").cloned(),
                    ..TransactionResult::failed("Missing or invalid value for `amount`.")
                }
            }
        },
    };
    TransactionResult {
        result: Some(result),
        psp_reference: string(object, "pspReference"),
        amount,
        message: string(object, "message"),
        external_url: string(object, "externalUrl"),
        data: object.get("data").cloned(),
        error: None,
    }
}

/// One app's answer to a payment gateway session initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentGatewayData {
    pub app_identifier: String,
    pub data: Option<Value>,
    pub error: Option<String>,
}

pub fn parse_payment_gateway_response(app_identifier: impl Into<String>, value: Option<&Value>) -> PaymentGatewayData {
    let app_identifier = app_identifier.into();
    match value.and_then(Value::as_object) {
        Some(object) => PaymentGatewayData {
            app_identifier,
            data: object.get("data").cloned(),
            error: None,
        },
        None => PaymentGatewayData {
            app_identifier,
            data: None,
            error: Some(FAILED_TO_DELIVER.to_string()),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoredPaymentMethodDeleteStatus {
    SuccessfullyDeleted,
    FailedToDelete,
    FailedToDeliver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPaymentMethodDeleteResult {
    pub result: StoredPaymentMethodDeleteStatus,
    pub error: Option<String>,
}

pub fn parse_stored_payment_method_delete(value: Option<&Value>) -> StoredPaymentMethodDeleteResult {
    let Some(object) = value.and_then(Value::as_object) else {
        return StoredPaymentMethodDeleteResult {
            result: StoredPaymentMethodDeleteStatus::FailedToDeliver,
            error: Some(FAILED_TO_DELIVER.to_string()),
        };
    };
    let result = match object.get("result").and_then(Value::as_str) {
        Some("SUCCESSFULLY_DELETED") => StoredPaymentMethodDeleteStatus::SuccessfullyDeleted,
        Some("FAILED_TO_DELETE") => StoredPaymentMethodDeleteStatus::FailedToDelete,
        _ => {
            return StoredPaymentMethodDeleteResult {
                result: StoredPaymentMethodDeleteStatus::FailedToDelete,
                error: Some("Missing or invalid value for `result`.".to_string()),
            }
        }
    };
    StoredPaymentMethodDeleteResult {
        result,
        error: string(object, "error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tax_data_requires_matching_lines() {
        let response = json!({
            "shipping_price_gross_amount": "12.30",
            "shipping_price_net_amount": 10,
            "shipping_tax_rate": 23,
            "lines": [{ "total_gross_amount": 24.6, "total_net_amount": 20, "tax_rate": 23 }],
        });
        let data = parse_tax_data(&response, 1).unwrap();
        assert_eq!(data.shipping_price_gross_amount, 12.3);
        assert_eq!(data.lines[0].tax_rate, 23.0);

        assert_eq!(
            parse_tax_data(&response, 2),
            Err(ResponseError::LineCountMismatch { expected: 2, actual: 1 })
        );
        assert_eq!(parse_tax_data(&json!([]), 0), Err(ResponseError::NotAnObject));
    }

    #[test]
    fn negative_tax_amounts_are_rejected() {
        let response = json!({
            "shipping_price_gross_amount": -1,
            "shipping_price_net_amount": 0,
            "shipping_tax_rate": 0,
            "lines": [],
        });
        assert_eq!(
            parse_tax_data(&response, 0),
            Err(ResponseError::NegativeAmount("shipping_price_gross_amount".into()))
        );
    }

    #[test]
    fn shipping_methods_get_app_scoped_ids() {
        let response = json!([
            { "id": "express", "name": "Express", "amount": 10, "currency": "USD", "maximum_delivery_days": 2 },
            { "name": "missing id", "amount": 1 },
        ]);
        let methods = parse_shipping_methods(&response, &AppId("12".into()));
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].id, "app:12:express");
        assert_eq!(methods[0].maximum_delivery_days, Some(2));
    }

    #[test]
    fn excluded_methods() {
        let response = json!({ "excluded_methods": [{ "id": "abc", "reason": "too heavy" }] });
        let excluded = parse_excluded_shipping_methods(&response).unwrap();
        assert_eq!(excluded, vec![ExcludedShippingMethod { id: "abc".into(), reason: Some("too heavy".into()) }]);
    }

    #[test]
    fn transaction_failures_are_typed() {
        assert_eq!(parse_transaction_response(None).error.as_deref(), Some(FAILED_TO_DELIVER));
        assert_eq!(
            parse_transaction_response(Some(&json!("not a map"))).error.as_deref(),
            Some(FAILED_TO_DELIVER)
        );

        let missing = parse_transaction_response(Some(&json!({ "pspReference": "psp" })));
        assert!(missing.is_failure());

        let ok = parse_transaction_response(Some(&json!({
            "result": "CHARGE_SUCCESS",
            "amount": "10.00",
            "pspReference": "psp-1",
            "data": { "client_secret": "x" },
        })));
        assert!(!ok.is_failure());
        assert_eq!(ok.amount, Some(10.0));
        assert_eq!(ok.data, Some(json!({ "client_secret": "x" })));
    }

    #[test]
    fn payment_gateway_and_stored_method_results() {
        let gateway = parse_payment_gateway_response("app.payments", Some(&json!({ "data": { "k": 1 } })));
        assert_eq!(gateway.data, Some(json!({ "k": 1 })));
        assert_eq!(parse_payment_gateway_response("app.payments", None).error.as_deref(), Some(FAILED_TO_DELIVER));

        let deleted = parse_stored_payment_method_delete(Some(&json!({ "result": "SUCCESSFULLY_DELETED" })));
        assert_eq!(deleted.result, StoredPaymentMethodDeleteStatus::SuccessfullyDeleted);
        assert_eq!(
            parse_stored_payment_method_delete(None).result,
            StoredPaymentMethodDeleteStatus::FailedToDeliver
        );
    }
}
