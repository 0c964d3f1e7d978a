#![forbid(unsafe_code)]

use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courselink_domain::{IdentityClaim, Role, UserId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::{SecretString, unix_secs_now};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
	#[error("no credential provided")]
	Missing,
	#[error("malformed token: {0}")]
	Malformed(&'static str),
	#[error("unsupported token algorithm: {0}")]
	UnsupportedAlgorithm(String),
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
}

#[derive(Debug, Deserialize)]
struct TokenHeader {
	alg: String,
}

/// Claims as written by the account service's session tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
	#[serde(rename = "userId")]
	user_id: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	role: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	exp: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	iat: Option<u64>,
}

/// Validates HS256 bearer tokens and extracts the identity they carry.
#[derive(Clone)]
pub struct IdentityVerifier {
	secret: SecretString,
}

impl std::fmt::Debug for IdentityVerifier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IdentityVerifier").finish_non_exhaustive()
	}
}

impl IdentityVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	/// Verify a compact `header.payload.signature` token.
	///
	/// `exp` is optional in the account service's tokens; when present it must lie in the future.
	pub fn verify(&self, credential: &str) -> Result<IdentityClaim, VerifyError> {
		let credential = credential.trim();
		if credential.is_empty() {
			return Err(VerifyError::Missing);
		}

		let mut parts = credential.split('.');
		let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
			(parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(VerifyError::Malformed("expected three segments"));
		};

		let header = URL_SAFE_NO_PAD
			.decode(header_b64)
			.map_err(|_| VerifyError::Malformed("header is not base64url"))?;
		let header: TokenHeader =
			serde_json::from_slice(&header).map_err(|_| VerifyError::Malformed("header is not json"))?;
		if header.alg != "HS256" {
			return Err(VerifyError::UnsupportedAlgorithm(header.alg));
		}

		let provided_sig = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|_| VerifyError::Malformed("signature is not base64url"))?;
		let expected_sig = sign(header_b64, payload_b64, self.secret.expose().as_bytes());
		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(VerifyError::BadSignature);
		}

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|_| VerifyError::Malformed("payload is not base64url"))?;
		let claims: TokenClaims =
			serde_json::from_slice(&payload).map_err(|_| VerifyError::Malformed("payload is missing userId"))?;

		if let Some(exp) = claims.exp
			&& exp <= unix_secs_now()
		{
			return Err(VerifyError::Expired);
		}

		Ok(IdentityClaim {
			user_id: UserId(claims.user_id),
			email: claims.email,
			role: claims.role.as_deref().and_then(|r| r.parse::<Role>().ok()),
		})
	}
}

/// Mint a token the verifier accepts. Session issuance lives in the account service;
/// this exists for tests and local tooling.
#[allow(dead_code)]
pub fn issue_token(claim: &IdentityClaim, secret: &str, ttl: Option<Duration>) -> String {
	let now = unix_secs_now();
	let claims = TokenClaims {
		user_id: claim.user_id.get(),
		email: claim.email.clone(),
		role: claim.role.map(|r| r.as_str().to_string()),
		exp: ttl.map(|ttl| now.saturating_add(ttl.as_secs())),
		iat: Some(now),
	};

	let header_b64 = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
	let sig = sign(&header_b64, &payload_b64, secret.as_bytes());

	format!("{header_b64}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

/// Pick the handshake credential: `token` query parameter, then `Authorization: Bearer`,
/// then the `token` cookie set by the web app.
pub fn extract_credential(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
	if let Some(t) = query_token.map(str::trim).filter(|t| !t.is_empty()) {
		return Some(t.to_string());
	}

	let bearer = headers
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
		.map(str::trim)
		.filter(|t| !t.is_empty());
	if let Some(t) = bearer {
		return Some(t.to_string());
	}

	headers
		.get_all(COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(';'))
		.filter_map(|pair| pair.trim().split_once('='))
		.find(|(name, value)| *name == "token" && !value.is_empty())
		.map(|(_, value)| value.to_string())
}

fn sign(header_b64: &str, payload_b64: &str, secret: &[u8]) -> Vec<u8> {
	// HMAC accepts keys of any length.
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(header_b64.as_bytes());
	mac.update(b".");
	mac.update(payload_b64.as_bytes());
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
