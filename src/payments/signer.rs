//! Outbound request signing
//!
//! Gateway hash format:
//! `sha512(key|txnid|amount|productinfo|firstname|email|udf1|udf2|udf3|udf4|udf5||||||SALT)`
//!
//! Field order and the five empty slots after `udf5` are fixed by the gateway.
//! Any change here breaks every payment silently at the gateway side.

use crate::error::{PaymentError, PaymentResult};
use crate::payments::types::{
    GatewayCredentials, PaymentRequest, SignedPaymentRequest, MAX_EXTENSION_FIELDS,
};
use sha2::{Digest, Sha512};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Separator between hashed fields
const HASH_SEPARATOR: &str = "|";

/// Five reserved slots between `udf5` and the salt
const RESERVED_SLOTS: &str = "||||||";

static LAST_GENERATED_ID: AtomicU64 = AtomicU64::new(0);

/// Formats an amount with exactly two decimals, the only form the gateway hashes
pub fn format_amount(amount: f64) -> String {
    format!("{:.2}", amount)
}

/// Parses a caller-supplied amount string and re-formats it
pub fn normalize_amount(raw: &str) -> PaymentResult<String> {
    let amount: f64 = raw
        .trim()
        .parse()
        .map_err(|_| PaymentError::validation("amount", format!("'{}' is not a number", raw)))?;
    validate_amount(amount)?;
    Ok(format_amount(amount))
}

/// Checks the amount as the gateway will see it, after rounding to two decimals
pub fn validate_amount(amount: f64) -> PaymentResult<()> {
    if amount.is_nan() || amount.is_infinite() {
        return Err(PaymentError::validation("amount", "Amount must be a finite number"));
    }
    let rounded: f64 = format_amount(amount).parse().unwrap_or(0.0);
    if amount <= 0.0 || rounded <= 0.0 {
        return Err(PaymentError::validation("amount", "Amount must be at least 0.01"));
    }
    Ok(())
}

/// Generates a transaction id from a clock reading that never repeats or goes
/// backwards within this process
pub fn generate_transaction_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut previous = LAST_GENERATED_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(previous + 1);
        match LAST_GENERATED_ID.compare_exchange_weak(
            previous,
            next,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return format!("TXN{}", next),
            Err(current) => previous = current,
        }
    }
}

pub(crate) fn sha512_hex(input: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Signs outbound payment requests with the merchant credentials
#[derive(Debug, Clone)]
pub struct RequestSigner {
    credentials: GatewayCredentials,
    service_provider: String,
}

impl RequestSigner {
    pub fn new(credentials: GatewayCredentials, service_provider: impl Into<String>) -> Self {
        Self {
            credentials,
            service_provider: service_provider.into(),
        }
    }

    pub fn merchant_key(&self) -> &str {
        &self.credentials.merchant_key
    }

    /// Validates the request, fills in a transaction id if needed and signs it
    pub fn sign(&self, request: PaymentRequest) -> PaymentResult<SignedPaymentRequest> {
        validate_amount(request.amount)?;
        require("product_info", &request.product_info)?;
        require("payer_name", &request.payer_name)?;
        require("payer_email", &request.payer_email)?;

        if request.extension_fields.len() > MAX_EXTENSION_FIELDS {
            return Err(PaymentError::validation(
                "extension_fields",
                format!(
                    "At most {} extension fields are allowed, got {}",
                    MAX_EXTENSION_FIELDS,
                    request.extension_fields.len()
                ),
            ));
        }

        let transaction_id = match request.transaction_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => generate_transaction_id(),
        };

        let mut extension_fields: [String; MAX_EXTENSION_FIELDS] = Default::default();
        for (slot, value) in extension_fields.iter_mut().zip(request.extension_fields) {
            *slot = value;
        }

        let amount = format_amount(request.amount);

        let mut parts: Vec<&str> = vec![
            self.credentials.merchant_key.as_str(),
            transaction_id.as_str(),
            amount.as_str(),
            request.product_info.as_str(),
            request.payer_name.as_str(),
            request.payer_email.as_str(),
        ];
        parts.extend(extension_fields.iter().map(String::as_str));

        let hash_input = format!(
            "{}{}{}",
            parts.join(HASH_SEPARATOR),
            RESERVED_SLOTS,
            self.credentials.salt
        );
        let signature = sha512_hex(&hash_input);

        debug!(
            transaction_id = %transaction_id,
            amount = %amount,
            "Signed payment request"
        );

        Ok(SignedPaymentRequest {
            key: self.credentials.merchant_key.clone(),
            transaction_id,
            amount,
            product_info: request.product_info,
            payer_name: request.payer_name,
            payer_email: request.payer_email,
            payer_phone: request.payer_phone,
            extension_fields,
            success_url: request.success_url,
            failure_url: request.failure_url,
            cancel_url: request.cancel_url,
            service_provider: self.service_provider.clone(),
            signature,
        })
    }
}

fn require(field: &str, value: &str) -> PaymentResult<()> {
    if value.trim().is_empty() {
        return Err(PaymentError::validation(field, format!("{} is required", field)));
    }
    Ok(())
}

impl SignedPaymentRequest {
    /// Gateway form fields in posting order
    pub fn form_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![
            ("key", self.key.as_str()),
            ("txnid", self.transaction_id.as_str()),
            ("amount", self.amount.as_str()),
            ("productinfo", self.product_info.as_str()),
            ("firstname", self.payer_name.as_str()),
            ("email", self.payer_email.as_str()),
            ("phone", self.payer_phone.as_str()),
        ];
        const UDF_NAMES: [&str; MAX_EXTENSION_FIELDS] = ["udf1", "udf2", "udf3", "udf4", "udf5"];
        fields.extend(
            UDF_NAMES
                .iter()
                .zip(self.extension_fields.iter())
                .map(|(name, value)| (*name, value.as_str())),
        );
        fields.extend([
            ("surl", self.success_url.as_str()),
            ("furl", self.failure_url.as_str()),
            ("curl", self.cancel_url.as_str()),
            ("service_provider", self.service_provider.as_str()),
            ("hash", self.signature.as_str()),
        ]);
        fields
    }

    /// Auto-submitting HTML form for the same-tab redirect channel
    pub fn render_auto_submit_form(&self, action_url: &str) -> String {
        let inputs: String = self
            .form_fields()
            .into_iter()
            .map(|(name, value)| {
                format!(
                    "<input type=\"hidden\" name=\"{}\" value=\"{}\"/>",
                    name,
                    html_escape::encode_quoted_attribute(value)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "<!DOCTYPE html>\n<html><body onload=\"document.forms[0].submit()\">\n<form method=\"post\" action=\"{}\">\n{}\n</form>\n</body></html>",
            html_escape::encode_quoted_attribute(action_url),
            inputs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLDEN_SIGNATURE: &str = "52a4caba5efc343b3b5640f416fa8569e014d2abecb65262151456c08777bf97a539aa4a637496b4e584751cc388a751dac5f7435ad47845d8334e7d5e6808ba";

    fn signer() -> RequestSigner {
        RequestSigner::new(GatewayCredentials::new("gtKFFx", "eCwWELxi"), "payu_paisa")
    }

    fn request(amount: f64) -> PaymentRequest {
        PaymentRequest {
            amount,
            product_info: "Mobile Recharge".to_string(),
            payer_name: "Asha".to_string(),
            payer_email: "asha@example.com".to_string(),
            payer_phone: "9876543210".to_string(),
            transaction_id: Some("T1".to_string()),
            extension_fields: Vec::new(),
            success_url: "https://shop.example.com/payment/success".to_string(),
            failure_url: "https://shop.example.com/payment/failure".to_string(),
            cancel_url: "https://shop.example.com/payment/cancel".to_string(),
        }
    }

    #[test]
    fn test_golden_signature() {
        let signed = signer().sign(request(99.9)).unwrap();
        assert_eq!(signed.amount, "99.90");
        assert_eq!(signed.signature, GOLDEN_SIGNATURE);
    }

    #[test]
    fn test_integer_and_decimal_amounts_sign_identically() {
        let a = signer().sign(request(10.0)).unwrap();
        let b = signer().sign(request(10.00)).unwrap();
        assert_eq!(a.amount, "10.00");
        assert_eq!(a.signature, b.signature);
    }

    #[test]
    fn test_format_amount_is_idempotent() {
        for raw in ["10", "10.00", "99.9", "0.5", "1234.567"] {
            let once = normalize_amount(raw).unwrap();
            let twice = normalize_amount(&once).unwrap();
            assert_eq!(once, twice, "formatting '{}' twice changed it", raw);
        }
    }

    #[test]
    fn test_rejects_invalid_amounts() {
        for amount in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = signer().sign(request(amount)).unwrap_err();
            assert!(matches!(err, PaymentError::Validation { .. }));
        }
        assert!(normalize_amount("ten").is_err());
    }

    #[test]
    fn test_rejects_amounts_that_round_to_zero() {
        for amount in [0.001, 0.004, -0.001] {
            let err = signer().sign(request(amount)).unwrap_err();
            assert!(matches!(err, PaymentError::Validation { .. }), "{}", amount);
        }
        assert!(normalize_amount("0.001").is_err());

        let signed = signer().sign(request(0.006)).unwrap();
        assert_eq!(signed.amount, "0.01");
    }

    #[test]
    fn test_rejects_missing_email() {
        let mut req = request(10.0);
        req.payer_email = "  ".to_string();
        let err = signer().sign(req).unwrap_err();
        assert_eq!(
            err,
            PaymentError::validation("payer_email", "payer_email is required")
        );
    }

    #[test]
    fn test_rejects_more_than_five_extension_fields() {
        let mut req = request(10.0);
        req.extension_fields = vec!["x".to_string(); 6];
        assert!(signer().sign(req).is_err());
    }

    #[test]
    fn test_generates_transaction_id_when_missing() {
        let mut req = request(10.0);
        req.transaction_id = None;
        let a = signer().sign(req.clone()).unwrap();
        let b = signer().sign(req).unwrap();
        assert!(a.transaction_id.starts_with("TXN"));
        assert_ne!(a.transaction_id, b.transaction_id);
    }

    #[test]
    fn test_generated_ids_increase() {
        let first: u64 = generate_transaction_id()[3..].parse().unwrap();
        let second: u64 = generate_transaction_id()[3..].parse().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_signed_request_never_contains_salt() {
        let signed = signer().sign(request(10.0)).unwrap();
        let json = serde_json::to_string(&signed).unwrap();
        assert!(!json.contains("eCwWELxi"));
        let form = signed.render_auto_submit_form("https://secure.payu.in/_payment");
        assert!(!form.contains("eCwWELxi"));
    }

    #[test]
    fn test_extension_fields_change_signature() {
        let plain = signer().sign(request(10.0)).unwrap();
        let mut req = request(10.0);
        req.extension_fields = vec!["operator:3".to_string()];
        let with_udf = signer().sign(req).unwrap();
        assert_eq!(with_udf.extension_fields[0], "operator:3");
        assert_eq!(with_udf.extension_fields[4], "");
        assert_ne!(plain.signature, with_udf.signature);
    }

    #[test]
    fn test_form_fields_order_and_escaping() {
        let mut req = request(10.0);
        req.product_info = "DTH <Gold>".to_string();
        req.payer_name = "Asha\" onfocus=\"x".to_string();
        let signed = signer().sign(req).unwrap();
        let names: Vec<&str> = signed.form_fields().iter().map(|(n, _)| *n).collect();
        assert_eq!(names.first(), Some(&"key"));
        assert_eq!(names.last(), Some(&"hash"));
        let html = signed.render_auto_submit_form("https://secure.payu.in/_payment");
        assert!(html.contains("DTH &lt;Gold&gt;"));
        assert!(html.contains("Asha&quot; onfocus=&quot;x"));
        assert!(!html.contains("\" onfocus"));
    }
}
