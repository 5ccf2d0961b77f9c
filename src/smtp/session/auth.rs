//! The AUTH dialogue (RFC 4954) for PLAIN, LOGIN and XOAUTH2.

use tokio::io::{AsyncRead, AsyncWrite};

use super::{reply, Response, Session};
use crate::{
    auth::{decode_login_field, decode_plain, decode_xoauth2, AuthResult, Mechanism},
    internal,
    smtp::state::{AuthStep, State},
    status::Status,
};

/// base64 of `Username:`
const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";

/// base64 of `Password:`
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    fn leave_auth(&mut self) {
        self.context.state = self
            .context
            .helo
            .as_ref()
            .map_or(State::Connect, State::greeted);
    }

    fn challenge(&mut self, step: AuthStep, prompt: &str) -> Response {
        self.context.state = State::Auth(step);
        reply(Status::AuthChallenge, prompt)
    }

    fn malformed(&mut self) -> Response {
        self.leave_auth();
        reply(
            Status::InvalidParameters,
            "5.5.2 Error: invalid authentication response",
        )
    }

    pub(super) fn start_auth(&mut self, mechanism: &str, initial: Option<&str>) -> Response {
        if !self.context.state.is_greeted() {
            let reason = if self.context.state.in_transaction() {
                "5.5.1 Error: MAIL transaction in progress"
            } else {
                "5.5.1 Error: send HELO/EHLO first"
            };
            return reply(Status::InvalidCommandSequence, reason);
        }

        if self.context.identity.is_some() {
            return reply(
                Status::InvalidCommandSequence,
                "5.5.1 Error: already authenticated",
            );
        }

        if !self.auth_allowed() {
            return reply(
                Status::EncryptionRequired,
                "5.7.11 Error: Must issue a STARTTLS command first",
            );
        }

        let Ok(mechanism) = mechanism.parse::<Mechanism>() else {
            return reply(
                Status::ParameterNotImplemented,
                "5.5.4 Error: Unrecognized authentication type",
            );
        };

        // "=" is an empty initial response
        let initial = initial.map(|response| if response == "=" { "" } else { response });

        match (mechanism, initial) {
            (Mechanism::Plain, Some(response)) => self.finish_plain(response),
            (Mechanism::Plain, None) => self.challenge(AuthStep::Plain, ""),
            (Mechanism::Login, Some(response)) => self.login_username(response),
            (Mechanism::Login, None) => self.challenge(AuthStep::LoginUsername, USERNAME_PROMPT),
            (Mechanism::XOAuth2, Some(response)) => self.finish_xoauth2(response),
            (Mechanism::XOAuth2, None) => self.challenge(AuthStep::XOAuth2, ""),
        }
    }

    /// Handle a client line while a SASL exchange is in progress.
    pub(super) fn continue_auth(&mut self, step: AuthStep, line: &[u8]) -> Response {
        let line = String::from_utf8_lossy(line);
        let response = line.trim();

        if response == "*" {
            self.leave_auth();
            return reply(Status::InvalidParameters, "5.7.0 Authentication aborted");
        }

        match step {
            AuthStep::Plain => self.finish_plain(response),
            AuthStep::LoginUsername => self.login_username(response),
            AuthStep::LoginPassword { username } => match decode_login_field(response) {
                Ok(password) => self.complete(Mechanism::Login, &username, &password),
                Err(_) => self.malformed(),
            },
            AuthStep::XOAuth2 => self.finish_xoauth2(response),
            AuthStep::XOAuth2Failed => {
                self.leave_auth();
                self.rejected(Mechanism::XOAuth2)
            }
        }
    }

    fn finish_plain(&mut self, response: &str) -> Response {
        match decode_plain(response) {
            Ok((username, password)) => self.complete(Mechanism::Plain, &username, &password),
            Err(_) => self.malformed(),
        }
    }

    fn login_username(&mut self, response: &str) -> Response {
        match decode_login_field(response) {
            Ok(username) => self.challenge(AuthStep::LoginPassword { username }, PASSWORD_PROMPT),
            Err(_) => self.malformed(),
        }
    }

    fn finish_xoauth2(&mut self, response: &str) -> Response {
        match decode_xoauth2(response) {
            Ok((username, token)) => self.complete(Mechanism::XOAuth2, &username, &token),
            Err(_) => self.malformed(),
        }
    }

    fn complete(&mut self, mechanism: Mechanism, username: &str, password: &str) -> Response {
        match self
            .gateway
            .authenticator()
            .authenticate(mechanism, username, password)
        {
            AuthResult::Success(identity) => {
                internal!(
                    level = INFO,
                    "{} authenticated as {identity} using {mechanism}",
                    self.peer
                );
                self.context.identity = Some(identity);
                self.leave_auth();
                reply(Status::AuthSucceeded, "2.7.0 Authentication successful")
            }
            AuthResult::Continue(challenge) => {
                self.challenge(AuthStep::XOAuth2Failed, &challenge)
            }
            AuthResult::Failure => {
                self.leave_auth();
                self.rejected(mechanism)
            }
        }
    }

    fn rejected(&self, mechanism: Mechanism) -> Response {
        internal!(
            level = WARN,
            "Authentication using {mechanism} failed for {}",
            self.peer
        );
        reply(
            Status::AuthInvalid,
            "5.7.8 Error: Invalid username or password",
        )
    }
}
