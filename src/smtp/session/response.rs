use core::fmt::Display;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{Event, Response, Session, Transaction, MAX_UNRECOGNISED};
use crate::{
    internal,
    smtp::{
        command::{Command, HeloVariant},
        extensions::Advertise,
        state::State,
    },
    status::Status,
};

/// A single-line reply that keeps the connection open.
pub fn reply(status: Status, text: impl Display) -> Response {
    (
        Some(vec![format!("{status} {text}")]),
        Event::ConnectionKeepAlive,
    )
}

/// A multi-line reply: every line but the last uses the `-` separator.
fn multiline(status: Status, lines: &[String]) -> Response {
    let last = lines.len().saturating_sub(1);

    (
        Some(
            lines
                .iter()
                .enumerate()
                .map(|(idx, line)| {
                    let separator = if idx == last { ' ' } else { '-' };
                    format!("{status}{separator}{line}")
                })
                .collect(),
        ),
        Event::ConnectionKeepAlive,
    )
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(super) fn greeting(&self) -> String {
        match self.config.banner.as_deref() {
            Some(banner) if !banner.is_empty() => format!(
                "{} {} ESMTP {banner}",
                Status::ServiceReady,
                self.config.server_name
            ),
            _ => format!("{} {} ESMTP", Status::ServiceReady, self.config.server_name),
        }
    }

    /// Return to the greeted state and forget the transaction.
    pub(super) fn reset_transaction(&mut self) {
        self.context.transaction = Transaction::default();
        self.context.message = Vec::new();
        self.context.oversized = false;
        self.context.state = self
            .context
            .helo
            .as_ref()
            .map_or(State::Connect, State::greeted);
    }

    pub(super) fn handle_command(&mut self, command: &Command) -> Response {
        self.dispatch(command).unwrap_or_else(|rejection| rejection)
    }

    fn advance(&self, command: &Command) -> Result<State, Response> {
        self.context
            .state
            .transition(command, self.context.helo.as_ref())
            .map_err(|reason| reply(Status::InvalidCommandSequence, reason))
    }

    fn dispatch(&mut self, command: &Command) -> Result<Response, Response> {
        match command {
            Command::Noop => Ok(reply(Status::Ok, "2.0.0 Ok")),
            Command::Help => Ok(reply(
                Status::HelpMessage,
                "See https://tools.ietf.org/html/rfc5321 for details",
            )),
            Command::Invalid(_) => Ok(reply(
                Status::InvalidParameters,
                "5.5.4 Error: syntax error in parameters",
            )),
            Command::Unrecognised(_) => Ok(self.unrecognised()),
            Command::Auth { mechanism, initial } => {
                Ok(self.start_auth(mechanism, initial.as_deref()))
            }
            Command::Helo(variant) => {
                let next = self.advance(command)?;
                self.context.helo = Some(variant.clone());
                self.reset_transaction();
                self.context.state = next;
                Ok(self.helo_response(variant))
            }
            Command::MailFrom { sender, size } => {
                let next = self.advance(command)?;
                self.mail_from(next, sender.clone(), *size)
            }
            Command::RcptTo(recipient) => {
                self.context.state = self.advance(command)?;
                self.context.transaction.recipients.push(recipient.clone());
                Ok(reply(Status::Ok, "2.1.5 Ok"))
            }
            Command::Data => {
                self.advance(command)?;
                self.context.state = State::Reading;
                self.context.line_start = true;
                self.context.message = Vec::new();
                Ok(reply(
                    Status::StartMailInput,
                    "End data with <CR><LF>.<CR><LF>",
                ))
            }
            Command::Rset => {
                self.advance(command)?;
                self.reset_transaction();
                Ok(reply(Status::Ok, "2.0.0 Ok"))
            }
            Command::Quit => {
                self.context.state = self.advance(command)?;
                Ok((
                    Some(vec![format!("{} 2.0.0 Bye", Status::GoodBye)]),
                    Event::ConnectionClose,
                ))
            }
            Command::StartTLS => self.starttls(command),
        }
    }

    fn helo_response(&self, variant: &HeloVariant) -> Response {
        let hello = format!(
            "{} says hello to {}",
            self.config.server_name,
            variant.id()
        );

        if !variant.is_extended() {
            return reply(Status::Ok, hello);
        }

        let advertise = Advertise {
            auth_allowed: self.auth_allowed(),
            starttls_available: self.config.tls.is_some() && !self.tls_active(),
            max_size: self.config.max_size,
            size_hidden: self.config.size_hidden,
        };

        let lines = std::iter::once(hello)
            .chain(advertise.extensions().iter().map(ToString::to_string))
            .collect::<Vec<_>>();

        multiline(Status::Ok, &lines)
    }

    fn mail_from(
        &mut self,
        next: State,
        sender: Option<String>,
        size: Option<usize>,
    ) -> Result<Response, Response> {
        if self.gateway.authenticator().is_required() && self.context.identity.is_none() {
            return Err(reply(
                Status::AuthRequired,
                "5.7.0 Error: authentication Required",
            ));
        }

        if let (Some(max), Some(size)) = (self.config.max_size, size) {
            if size > max {
                return Err(reply(
                    Status::ExceededStorage,
                    format!("5.3.4 Error: message exceeds fixed maximum message size {max}"),
                ));
            }
        }

        self.context.transaction = Transaction {
            sender,
            recipients: Vec::new(),
            declared_size: size,
        };
        self.context.state = next;

        Ok(reply(Status::Ok, "2.1.0 Ok"))
    }

    fn starttls(&mut self, command: &Command) -> Result<Response, Response> {
        if self.tls_active() {
            return Err(reply(
                Status::InvalidCommandSequence,
                "5.5.1 Error: TLS already active",
            ));
        }

        if self.config.tls.is_none() {
            return Err(reply(
                Status::NotImplemented,
                "5.5.1 Error: command not implemented",
            ));
        }

        self.context.state = self.advance(command)?;
        Ok(reply(Status::ServiceReady, "2.0.0 Ready to start TLS"))
    }

    fn unrecognised(&mut self) -> Response {
        self.context.unrecognised += 1;

        if self.context.unrecognised >= MAX_UNRECOGNISED {
            internal!(
                level = INFO,
                "Closing session with {} after {} unrecognised commands",
                self.peer,
                self.context.unrecognised
            );
            self.context.state = State::Close;
            return (
                Some(vec![format!(
                    "{} 4.7.0 {} Error: too many unrecognized commands",
                    Status::Unavailable,
                    self.config.server_name
                )]),
                Event::ConnectionClose,
            );
        }

        reply(Status::SyntaxError, "5.5.2 Error: command not recognized")
    }
}
