//! Callback authenticity check
//!
//! Reverse hash format:
//! `sha512([additionalCharges|]SALT|status||||||udf5|udf4|udf3|udf2|udf1|email|firstname|productinfo|amount|txnid|key)`
//!
//! This is the only place callback data becomes trustworthy. Anything that
//! reads a callback without going through [`CallbackVerifier::verify`] has no
//! defense against a forged success.

use crate::payments::signer::sha512_hex;
use constant_time_eq::constant_time_eq;
use crate::payments::types::{
    GatewayCallback, GatewayCredentials, VerificationOutcome, VerificationResult,
};
use tracing::{debug, warn};

pub struct CallbackVerifier {
    credentials: GatewayCredentials,
}

impl CallbackVerifier {
    pub fn new(credentials: GatewayCredentials) -> Self {
        Self { credentials }
    }

    /// Hash input the gateway should have signed for this callback.
    /// `None` when the callback lacks the fields needed to build it.
    pub fn expected_hash_input(&self, callback: &GatewayCallback) -> Option<String> {
        let status = callback.status()?;
        let transaction_id = callback.transaction_id()?;

        let mut input = String::new();
        if let Some(charges) = callback.additional_charges() {
            input.push_str(charges);
            input.push('|');
        }
        input.push_str(&self.credentials.salt);
        input.push('|');
        input.push_str(status);
        input.push_str("||||||");

        let mut tail: Vec<&str> = (1..=5)
            .rev()
            .map(|index| callback.extension_field(index))
            .collect();
        tail.extend([
            callback.payer_email().unwrap_or(""),
            callback.payer_name().unwrap_or(""),
            callback.product_info().unwrap_or(""),
            callback.amount().unwrap_or(""),
            transaction_id,
            self.credentials.merchant_key.as_str(),
        ]);
        input.push_str(&tail.join("|"));

        Some(input)
    }

    pub fn verify(&self, callback: &GatewayCallback) -> VerificationResult {
        let status = callback.status().unwrap_or("").to_string();
        let transaction_id = callback.transaction_id().unwrap_or("").to_string();

        let mut result = VerificationResult {
            is_valid: false,
            outcome: VerificationOutcome::Skipped,
            status,
            transaction_id,
            gateway_transaction_id: callback.gateway_transaction_id().unwrap_or("").to_string(),
            amount: callback.amount().unwrap_or("").to_string(),
        };

        let Some(hash_input) = self.expected_hash_input(callback) else {
            debug!("Callback missing transaction id or status, verification skipped");
            return result;
        };

        let Some(provided) = callback.signature() else {
            warn!(
                transaction_id = %result.transaction_id,
                "Callback carries no signature"
            );
            result.outcome = VerificationOutcome::Mismatch;
            return result;
        };

        let computed = sha512_hex(&hash_input);
        if constant_time_eq(computed.as_bytes(), provided.as_bytes()) {
            result.is_valid = true;
            result.outcome = VerificationOutcome::Verified;
            debug!(transaction_id = %result.transaction_id, "Callback signature verified");
        } else {
            warn!(
                transaction_id = %result.transaction_id,
                "Callback signature mismatch"
            );
            result.outcome = VerificationOutcome::Mismatch;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLDEN_CALLBACK_HASH: &str = "d718622ba9d42fb6f9c42199e0f89cacb82ecc5ab781f12aab16b8a14f78215c691cfe1a1200a59f2d47d62f3b205016b3ac09805e38423fe188c0cf5aa185c8";

    fn verifier() -> CallbackVerifier {
        CallbackVerifier::new(GatewayCredentials::new("gtKFFx", "eCwWELxi"))
    }

    fn callback() -> GatewayCallback {
        GatewayCallback::from_pairs([
            ("status", "success"),
            ("txnid", "T1"),
            ("amount", "99.90"),
            ("productinfo", "Mobile Recharge"),
            ("firstname", "Asha"),
            ("email", "asha@example.com"),
            ("mihpayid", "403993715524045752"),
            ("hash", GOLDEN_CALLBACK_HASH),
        ])
    }

    #[test]
    fn test_golden_callback_verifies() {
        let result = verifier().verify(&callback());
        assert!(result.is_valid);
        assert_eq!(result.outcome, VerificationOutcome::Verified);
        assert_eq!(result.status, "success");
        assert_eq!(result.transaction_id, "T1");
        assert_eq!(result.gateway_transaction_id, "403993715524045752");
        assert_eq!(result.amount, "99.90");
    }

    #[test]
    fn test_uppercase_signature_is_rejected() {
        let mut cb = callback();
        cb.insert("hash", GOLDEN_CALLBACK_HASH.to_uppercase());
        assert_eq!(verifier().verify(&cb).outcome, VerificationOutcome::Mismatch);
    }

    #[test]
    fn test_signature_of_other_length_is_rejected() {
        for hash in [
            GOLDEN_CALLBACK_HASH[..64].to_string(),
            format!("{}00", GOLDEN_CALLBACK_HASH),
            String::new(),
        ] {
            let mut cb = callback();
            cb.insert("hash", hash);
            assert_eq!(verifier().verify(&cb).outcome, VerificationOutcome::Mismatch);
        }
    }

    #[test]
    fn test_wrong_salt_is_rejected() {
        let other = CallbackVerifier::new(GatewayCredentials::new("gtKFFx", "other-salt"));
        let result = other.verify(&callback());
        assert!(!result.is_valid);
        assert_eq!(result.outcome, VerificationOutcome::Mismatch);
    }

    #[test]
    fn test_tampered_status_is_rejected() {
        let mut cb = callback();
        cb.insert("status", "failure");
        assert!(!verifier().verify(&cb).is_valid);
    }

    #[test]
    fn test_missing_transaction_id_is_skipped() {
        let mut cb = GatewayCallback::new();
        cb.insert("status", "success");
        cb.insert("hash", GOLDEN_CALLBACK_HASH);
        let result = verifier().verify(&cb);
        assert!(!result.is_valid);
        assert_eq!(result.outcome, VerificationOutcome::Skipped);
    }

    #[test]
    fn test_missing_status_is_skipped() {
        let cb = GatewayCallback::from_pairs([("txnid", "T1"), ("hash", GOLDEN_CALLBACK_HASH)]);
        assert_eq!(verifier().verify(&cb).outcome, VerificationOutcome::Skipped);
    }

    #[test]
    fn test_missing_signature_is_mismatch() {
        let cb = GatewayCallback::from_pairs([("txnid", "T1"), ("status", "success")]);
        let result = verifier().verify(&cb);
        assert!(!result.is_valid);
        assert_eq!(result.outcome, VerificationOutcome::Mismatch);
    }

    #[test]
    fn test_additional_charges_are_prefixed() {
        let mut cb = callback();
        cb.insert("additionalCharges", "2.00");
        let input = verifier().expected_hash_input(&cb).unwrap();
        assert!(input.starts_with("2.00|eCwWELxi|success||||||"));
        assert!(!verifier().verify(&cb).is_valid);
    }

    #[test]
    fn test_extension_fields_are_reversed() {
        let mut cb = callback();
        for i in 1..=5 {
            cb.insert(format!("udf{}", i), format!("u{}", i));
        }
        let input = verifier().expected_hash_input(&cb).unwrap();
        assert!(input.contains("||||||u5|u4|u3|u2|u1|asha@example.com"));
    }
}
