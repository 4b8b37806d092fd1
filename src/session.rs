use chrono::{DateTime, Utc};
use secrecy::SecretString;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Valid,
    Expired,
    /// Signed in, but the server gave no expiry.
    Unknown,
}

/// Last credentials used to sign in, kept for transparent renewal.
#[derive(Debug)]
pub(crate) struct Credentials {
    pub email: String,
    pub password: SecretString,
}

/// Bearer token and what we know about its lifetime.
#[derive(Debug)]
pub(crate) struct Session {
    pub token: SecretString,
    pub account: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when the server rejected the token.
    pub revoked: bool,
    /// Increments with every sign-in; lets concurrent callers tell whether
    /// someone else already renewed the token they saw fail.
    pub generation: u64,
}

impl Session {
    pub fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        if self.revoked {
            return SessionStatus::Expired;
        }
        match self.expires_at {
            Some(at) if now >= at => SessionStatus::Expired,
            Some(_) => SessionStatus::Valid,
            None => SessionStatus::Unknown,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status_at(Utc::now()) != SessionStatus::Expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(expires_at: Option<DateTime<Utc>>) -> Session {
        Session {
            token: SecretString::from("t"),
            account: None,
            expires_at,
            revoked: false,
            generation: 1,
        }
    }

    #[test]
    fn status_follows_expiry() {
        let now = Utc::now();
        assert_eq!(
            session(Some(now + Duration::minutes(5))).status_at(now),
            SessionStatus::Valid
        );
        assert_eq!(
            session(Some(now - Duration::minutes(5))).status_at(now),
            SessionStatus::Expired
        );
        assert_eq!(session(None).status_at(now), SessionStatus::Unknown);
    }

    #[test]
    fn debug_output_hides_token() {
        let mut s = session(None);
        s.token = SecretString::from("bearer-abc123");
        assert!(!format!("{s:?}").contains("bearer-abc123"));
    }

    #[test]
    fn revoked_session_is_expired() {
        let mut s = session(None);
        s.revoked = true;
        assert_eq!(s.status_at(Utc::now()), SessionStatus::Expired);
        assert!(!s.is_usable());
    }
}
