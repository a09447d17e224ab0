use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::error::{AppError, AppResult};

/// Upper bound for JSON bodies read by [`validate_json`]
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Reject the request unless its content type starts with `expected`
pub fn require_content_type(headers: &HeaderMap, expected: &str) -> AppResult<()> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let mime = content_type.split(';').next().unwrap_or_default().trim();
    if mime.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(AppError::UnsupportedContentType(content_type.to_string()))
    }
}

/// Deserialize and validate a JSON body before the handler sees it.
///
/// Used as `route_layer(from_fn(validate_json::<T>))`; the body is put back
/// untouched so the handler can still extract `Json<T>`.
pub async fn validate_json<T: DeserializeOwned + Validate>(
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    require_content_type(req.headers(), "application/json")?;

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::InvalidInput("Invalid request body".to_string()))?;

    let value: T = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::InvalidInput(format!("Invalid JSON: {}", e)))?;

    value.validate().map_err(|e| {
        let errors = e
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        AppError::InvalidInput(format!("Validation failed: {}", errors))
    })?;

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

/// Trim the submitted number and drop inner spaces ("4539 1488 0343 6467")
pub fn normalize_order_number(raw: &str) -> String {
    raw.trim().chars().filter(|c| *c != ' ').collect()
}

/// Luhn checksum over a string of ASCII digits; anything else is invalid.
pub fn luhn_valid(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }

    let mut sum = 0u32;
    for (position, c) in number.chars().rev().enumerate() {
        let Some(mut digit) = c.to_digit(10) else {
            return false;
        };
        if position % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }

    sum % 10 == 0
}

/// Normalize then check an order number, `InvalidOrderNumber` on failure
pub fn parse_order_number(raw: &str) -> AppResult<String> {
    let number = normalize_order_number(raw);
    if luhn_valid(&number) {
        Ok(number)
    } else {
        Err(AppError::InvalidOrderNumber(raw.trim().to_string()))
    }
}
