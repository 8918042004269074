//! Connection challenge: the server sends random bytes, the client answers,
//! an `Authenticator` judges the answer.

use rand::RngCore;

pub const CHALLENGE_LEN: usize = 32;

pub type Challenge = [u8; CHALLENGE_LEN];

/// Pluggable challenge scheme. Implementations decide what a valid answer is.
pub trait Authenticator: Send + Sync {
    /// Client side: answer a challenge from the server.
    fn respond(&self, challenge: &Challenge) -> Challenge;

    /// Server side: accept or refuse an answer.
    fn verify(&self, challenge: &Challenge, response: &Challenge) -> bool;
}

/// Echoes the challenge and accepts any answer. Provides no security.
#[derive(Debug, Default, Clone, Copy)]
pub struct Permissive;

impl Authenticator for Permissive {
    fn respond(&self, challenge: &Challenge) -> Challenge {
        *challenge
    }

    fn verify(&self, _challenge: &Challenge, _response: &Challenge) -> bool {
        true
    }
}

pub fn new_challenge() -> Challenge {
    let mut c = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut c);
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_accepts_anything() {
        let c = new_challenge();
        let auth = Permissive;
        assert_eq!(auth.respond(&c), c);
        assert!(auth.verify(&c, &[0u8; CHALLENGE_LEN]));
    }

    #[test]
    fn challenges_differ() {
        assert_ne!(new_challenge(), new_challenge());
    }
}
