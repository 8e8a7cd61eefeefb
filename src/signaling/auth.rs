//! Challenge-response viewer login
//!
//! The bridge hands each connection a random `securityKey`; the viewer proves
//! it knows the shared password by sending
//! `hex(SHA256(securityKey + "|" + timestamp + "|" + password))` along with
//! the timestamp it used.

use super::message::LoginRequest;
use super::ttl_map::{FailureCounter, ReplayGuard};
use crate::config::AuthConfig;
use log::{info, warn};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

const SECURITY_KEY_LEN: usize = 32;

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Fresh per-connection challenge
pub fn generate_security_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SECURITY_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Login token for the given challenge, timestamp and password
pub fn compute_token(security_key: &str, timestamp_ms: i64, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", security_key, timestamp_ms, password).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of one login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted,
    /// Bad token or stale timestamp
    Rejected,
    /// Token already used within its TTL
    Replayed,
    /// Too many failures from this IP
    LockedOut,
}

#[derive(Debug, Clone)]
pub struct AuthPolicy {
    pub password: String,
    pub token_ttl: Duration,
    pub clock_skew_ms: i64,
    pub failure_window: Duration,
    pub lockout_threshold: u32,
}

impl From<&AuthConfig> for AuthPolicy {
    fn from(config: &AuthConfig) -> Self {
        Self {
            password: config.password.clone(),
            token_ttl: Duration::from_secs(config.token_ttl_secs),
            clock_skew_ms: config.clock_skew_ms as i64,
            failure_window: Duration::from_secs(config.failure_window_secs),
            lockout_threshold: config.lockout_threshold,
        }
    }
}

/// Validates logins against the shared password with replay and
/// brute-force protection
#[derive(Debug)]
pub struct Authenticator {
    policy: AuthPolicy,
    tokens: ReplayGuard,
    failures: FailureCounter,
}

impl Authenticator {
    pub fn new(policy: AuthPolicy) -> Self {
        Self {
            tokens: ReplayGuard::new(policy.token_ttl),
            failures: FailureCounter::new(policy.failure_window),
            policy,
        }
    }

    pub fn is_locked_out(&self, ip: &str, now_ms: i64) -> bool {
        self.failures.count(ip, now_ms) > self.policy.lockout_threshold
    }

    /// Check one attempt.
    ///
    /// Order matters: lockout first (nothing is recorded), then the replay
    /// check, which records the token whatever the outcome, then the digest
    /// and clock-skew checks.
    pub fn verify(&self, security_key: &str, req: &LoginRequest, ip: &str, now_ms: i64) -> LoginOutcome {
        if self.is_locked_out(ip, now_ms) {
            warn!("Login from {} refused: too many failed attempts", ip);
            return LoginOutcome::LockedOut;
        }

        if !self.tokens.check_and_record(&req.token, now_ms) {
            warn!("Replayed login token from {}", ip);
            return LoginOutcome::Replayed;
        }

        let expected = compute_token(security_key, req.timestamp, &self.policy.password);
        let fresh = req.timestamp.abs_diff(now_ms) <= self.policy.clock_skew_ms.unsigned_abs();

        if expected == req.token && fresh {
            info!("Viewer at {} authenticated", ip);
            LoginOutcome::Accepted
        } else {
            let failures = self.failures.record_failure(ip, now_ms);
            warn!(
                "Login from {} rejected ({}; {} failures)",
                ip,
                if fresh { "bad token" } else { "stale timestamp" },
                failures
            );
            LoginOutcome::Rejected
        }
    }

    /// Start the background sweeps for the token and failure maps
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.tokens.spawn_sweeper(self.policy.token_ttl),
            self.failures.spawn_sweeper(Duration::from_secs(60)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const KEY: &str = "challenge";
    const NOW: i64 = 1_700_000_000_000;

    fn authenticator() -> Authenticator {
        Authenticator::new(AuthPolicy::from(&Config::default().auth))
    }

    fn request(timestamp: i64, password: &str) -> LoginRequest {
        LoginRequest {
            max_size: None,
            token: compute_token(KEY, timestamp, password),
            timestamp,
        }
    }

    #[test]
    fn test_compute_token_is_sha256_hex() {
        let token = compute_token("k", 1, "p");
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(token, compute_token("k", 1, "p"));
        assert_ne!(token, compute_token("k", 2, "p"));
    }

    #[test]
    fn test_security_key_shape() {
        let a = generate_security_key();
        assert_eq!(a.len(), SECURITY_KEY_LEN);
        assert_ne!(a, generate_security_key());
    }

    #[test]
    fn test_accept_then_replay() {
        let auth = authenticator();
        let req = request(NOW, "castbridge");
        assert_eq!(auth.verify(KEY, &req, "10.0.0.2", NOW), LoginOutcome::Accepted);
        assert_eq!(auth.verify(KEY, &req, "10.0.0.2", NOW + 5), LoginOutcome::Replayed);
    }

    #[test]
    fn test_timestamp_boundary() {
        let auth = authenticator();
        for ts in [NOW - 10_000, NOW + 10_000] {
            assert_eq!(auth.verify(KEY, &request(ts, "castbridge"), "10.0.0.2", NOW), LoginOutcome::Accepted);
        }
        for ts in [NOW - 10_001, NOW + 10_001] {
            assert_eq!(auth.verify(KEY, &request(ts, "castbridge"), "10.0.0.2", NOW), LoginOutcome::Rejected);
        }
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let auth = authenticator();
        for ts in [i64::MIN, i64::MAX] {
            assert_eq!(auth.verify(KEY, &request(ts, "castbridge"), "10.0.0.3", NOW), LoginOutcome::Rejected);
        }
    }

    #[test]
    fn test_wrong_password_rejected() {
        let auth = authenticator();
        assert_eq!(auth.verify(KEY, &request(NOW, "nope"), "10.0.0.2", NOW), LoginOutcome::Rejected);
    }

    #[test]
    fn test_lockout_after_threshold() {
        let auth = authenticator();
        let ip = "192.168.1.50";
        for i in 0..21 {
            let outcome = auth.verify(KEY, &request(NOW + i, "nope"), ip, NOW);
            assert_eq!(outcome, LoginOutcome::Rejected, "attempt {}", i + 1);
        }
        assert!(auth.is_locked_out(ip, NOW));

        // Even a correct token is refused without being consumed
        let good = request(NOW, "castbridge");
        assert_eq!(auth.verify(KEY, &good, ip, NOW), LoginOutcome::LockedOut);
        assert_eq!(auth.verify(KEY, &good, "192.168.1.51", NOW), LoginOutcome::Accepted);
    }

    #[test]
    fn test_lockout_expires_with_window() {
        let auth = authenticator();
        let ip = "192.168.1.60";
        for i in 0..21 {
            auth.verify(KEY, &request(NOW + i, "nope"), ip, NOW);
        }
        let later = NOW + 3_600_001;
        assert!(!auth.is_locked_out(ip, later));
        assert_eq!(auth.verify(KEY, &request(later, "castbridge"), ip, later), LoginOutcome::Accepted);
    }
}
