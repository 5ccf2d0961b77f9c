use core::fmt::{self, Display, Formatter};

use super::command::{Command, HeloVariant};

/// Where a SASL exchange is waiting for the client's next line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// `334 ` sent, waiting for the PLAIN response.
    Plain,
    LoginUsername,
    LoginPassword { username: String },
    /// `334 ` sent, waiting for the XOAUTH2 response.
    XOAuth2,
    /// The error challenge was sent; the next line ends the exchange with 535.
    XOAuth2Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Connect,
    Ehlo {
        id: String,
    },
    Helo {
        id: String,
    },
    /// STARTTLS accepted; the handshake follows the reply.
    StartTls,
    Auth(AuthStep),
    MailFrom,
    RcptTo,
    /// DATA accepted; the 354 reply has not been sent yet.
    Data,
    /// Receiving message content up to the lone dot.
    Reading,
    /// Message complete and handed to the gateway.
    PostDot,
    Quit,
    Close,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Reading | Self::PostDot => "",
            Self::Connect => "Connect",
            Self::Close => "Close",
            Self::Ehlo { .. } => "EHLO",
            Self::Helo { .. } => "HELO",
            Self::StartTls => "STARTTLS",
            Self::Auth(_) => "AUTH",
            Self::MailFrom => "MAIL",
            Self::RcptTo => "RCPT",
            Self::Data => "DATA",
            Self::Quit => "QUIT",
        })
    }
}

impl State {
    /// The state a session returns to between transactions.
    #[must_use]
    pub fn greeted(helo: &HeloVariant) -> Self {
        match helo {
            HeloVariant::Ehlo(id) => Self::Ehlo { id: id.clone() },
            HeloVariant::Helo(id) => Self::Helo { id: id.clone() },
        }
    }

    #[must_use]
    pub const fn is_greeted(&self) -> bool {
        matches!(self, Self::Ehlo { .. } | Self::Helo { .. })
    }

    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(self, Self::MailFrom | Self::RcptTo)
    }

    /// Transition on a sequencing command.
    ///
    /// `helo` is the greeting the session last accepted, used when a
    /// command returns the session to its greeted state.
    ///
    /// # Errors
    /// The reason text for a `503` when the command is out of sequence
    pub fn transition(
        &self,
        command: &Command,
        helo: Option<&HeloVariant>,
    ) -> Result<Self, &'static str> {
        match (self, command) {
            (_, Command::Quit) => Ok(Self::Quit),

            (
                Self::Connect
                | Self::Ehlo { .. }
                | Self::Helo { .. }
                | Self::MailFrom
                | Self::RcptTo,
                Command::Helo(variant),
            ) => Ok(Self::greeted(variant)),

            (_, Command::Rset) => Ok(helo.map_or(Self::Connect, Self::greeted)),

            (Self::Ehlo { .. } | Self::Helo { .. }, Command::StartTLS) => Ok(Self::StartTls),
            (Self::Ehlo { .. } | Self::Helo { .. }, Command::MailFrom { .. }) => Ok(Self::MailFrom),
            (Self::MailFrom | Self::RcptTo, Command::RcptTo(_)) => Ok(Self::RcptTo),
            (Self::RcptTo, Command::Data) => Ok(Self::Data),

            (Self::Connect, Command::StartTLS | Command::MailFrom { .. }) => {
                Err("5.5.1 Error: send HELO/EHLO first")
            }
            (Self::MailFrom | Self::RcptTo, Command::StartTLS) => {
                Err("5.5.1 Error: MAIL transaction in progress")
            }
            (Self::MailFrom | Self::RcptTo, Command::MailFrom { .. }) => {
                Err("5.5.1 Error: nested MAIL command")
            }
            (Self::MailFrom, Command::Data) => Err("5.5.1 Error: need RCPT command"),
            (_, Command::RcptTo(_) | Command::Data) => Err("5.5.1 Error: need MAIL command"),

            _ => Err("5.5.1 Error: bad sequence of commands"),
        }
    }
}
