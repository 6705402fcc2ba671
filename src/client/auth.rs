//! SASL challenge/response authentication.

use std::fmt::Debug;

use crate::{
    error::{Error, Result},
    options::{Credential, EndPoint},
};

/// Creates an [`Authenticator`] for each connection that the server asks to
/// authenticate.
pub trait AuthenticatorProvider: Send + Sync + Debug {
    /// Called with the authenticator class name from the server's AUTHENTICATE
    /// message.
    fn new_authenticator(
        &self,
        endpoint: &EndPoint,
        authenticator: &str,
    ) -> Result<Box<dyn Authenticator>>;
}

/// Produces the SASL tokens for one connection's AUTH_RESPONSE/AUTH_CHALLENGE
/// round-trips. The driver calls `initial_response` once, then `evaluate_challenge`
/// for every AUTH_CHALLENGE, until the server sends AUTH_SUCCESS.
pub trait Authenticator: Send {
    /// The token for the first AUTH_RESPONSE.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;

    /// The token answering a server challenge.
    fn evaluate_challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>>;

    /// Called with the final token carried by AUTH_SUCCESS.
    fn on_authentication_success(&mut self, _token: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
}

/// SASL PLAIN, as accepted by `PasswordAuthenticator`.
#[derive(Clone, Debug)]
pub(crate) struct PlainTextAuthProvider {
    credential: Credential,
}

impl PlainTextAuthProvider {
    pub(crate) fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

impl AuthenticatorProvider for PlainTextAuthProvider {
    fn new_authenticator(
        &self,
        _endpoint: &EndPoint,
        _authenticator: &str,
    ) -> Result<Box<dyn Authenticator>> {
        Ok(Box::new(PlainTextAuthenticator {
            credential: self.credential.clone(),
        }))
    }
}

struct PlainTextAuthenticator {
    credential: Credential,
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        // authzid NUL authcid NUL password
        let mut token = Vec::with_capacity(
            self.credential.username.len() + self.credential.password.len() + 2,
        );
        token.push(0);
        token.extend_from_slice(self.credential.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.credential.password.as_bytes());
        Ok(Some(token))
    }

    fn evaluate_challenge(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        Err(Error::authentication_error(
            "PLAIN",
            "server issued an unexpected challenge",
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_initial_response_is_nul_separated() {
        let provider = PlainTextAuthProvider::new(Credential {
            username: "cassandra".to_string(),
            password: "secret".to_string(),
        });
        let mut authenticator = provider
            .new_authenticator(
                &EndPoint::new("10.0.0.1", 9042),
                "org.apache.cassandra.auth.PasswordAuthenticator",
            )
            .unwrap();
        let token = authenticator.initial_response().unwrap().unwrap();
        assert_eq!(token, b"\0cassandra\0secret");
        assert!(authenticator.evaluate_challenge(None).is_err());
    }
}
