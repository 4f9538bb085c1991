//! Authentication state for a client group: a decoded token carries
//! `sub` and optionally `iat`; token *parsing* is out of scope.

use errors::ErrorMetadata;
use types::auth_contract::TokenData;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Unknown,
    User(TokenData),
}

impl Identity {
    pub fn from_token(token: Option<TokenData>) -> Self {
        match token {
            Some(t) => Identity::User(t),
            None => Identity::Unknown,
        }
    }

    pub fn sub(&self) -> Option<&str> {
        match self {
            Identity::Unknown => None,
            Identity::User(t) => Some(&t.sub),
        }
    }

    fn iat(&self) -> Option<i64> {
        match self {
            Identity::Unknown => None,
            Identity::User(t) => t.iat,
        }
    }
}

/// Decides whether to accept a newly-presented identity given the
/// client group's previously-accepted one. Any ambiguous transition
/// rejects rather than guesses.
pub fn pick_token(previous: &Identity, new: &Identity) -> Result<Identity, ErrorMetadata> {
    match (previous, new) {
        (Identity::Unknown, _) => Ok(new.clone()),
        (Identity::User(_), Identity::Unknown) => Err(ErrorMetadata::unauthorized(
            "client group is pinned to a user but a new connection presented no token",
        )),
        (Identity::User(prev), Identity::User(next)) => {
            if prev.sub != next.sub {
                return Err(ErrorMetadata::unauthorized(format!(
                    "client group is pinned to subject {} but a new connection presented {}",
                    prev.sub, next.sub
                )));
            }
            match (previous.iat(), new.iat()) {
                (None, _) => Ok(new.clone()),
                (Some(_), None) => Err(ErrorMetadata::unauthorized(
                    "previous token had an issued-at time but the new one has none",
                )),
                (Some(t1), Some(t2)) => {
                    if t2 > t1 {
                        Ok(new.clone())
                    } else {
                        // Tie or older: keep the previous identity.
                        Ok(previous.clone())
                    }
                },
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(sub: &str, iat: Option<i64>) -> Identity {
        Identity::User(TokenData {
            sub: sub.to_string(),
            iat,
        })
    }

    #[test]
    fn unknown_previous_accepts_anything() {
        let picked = pick_token(&Identity::Unknown, &user("a", None)).unwrap();
        assert_eq!(picked, user("a", None));
    }

    #[test]
    fn defined_previous_rejects_unknown_new() {
        assert!(pick_token(&user("a", None), &Identity::Unknown).is_err());
    }

    #[test]
    fn mismatched_subjects_reject() {
        assert!(pick_token(&user("a", None), &user("b", None)).is_err());
    }

    #[test]
    fn undefined_iat_on_previous_accepts_new() {
        let picked = pick_token(&user("a", None), &user("a", Some(5))).unwrap();
        assert_eq!(picked, user("a", Some(5)));
    }

    #[test]
    fn losing_iat_rejects() {
        assert!(pick_token(&user("a", Some(5)), &user("a", None)).is_err());
    }

    #[test]
    fn larger_iat_wins() {
        let picked = pick_token(&user("a", Some(1)), &user("a", Some(2))).unwrap();
        assert_eq!(picked, user("a", Some(2)));
    }

    #[test]
    fn tied_iat_keeps_previous() {
        let picked = pick_token(&user("a", Some(3)), &user("a", Some(3))).unwrap();
        assert_eq!(picked, user("a", Some(3)));
    }

    #[test]
    fn smaller_iat_keeps_previous() {
        let picked = pick_token(&user("a", Some(5)), &user("a", Some(2))).unwrap();
        assert_eq!(picked, user("a", Some(5)));
    }
}
