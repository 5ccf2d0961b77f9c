use core::fmt::{self, Display, Formatter};

#[derive(PartialEq, Eq, Clone, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Ehlo(id) | Self::Helo(id) => id,
        }
    }

    #[must_use]
    pub const fn is_extended(&self) -> bool {
        matches!(self, Self::Ehlo(_))
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Command {
    Helo(HeloVariant),
    /// A `None` sender is the null reverse-path (`MAIL FROM:<>`).
    MailFrom {
        sender: Option<String>,
        size: Option<usize>,
    },
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Help,
    Quit,
    StartTLS,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// A known verb with unusable arguments.
    Invalid(String),
    /// A verb this server does not implement.
    Unrecognised(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => write!(fmt, "{v} {}", v.id()),
            Self::MailFrom { sender, size } => {
                write!(fmt, "MAIL FROM:<{}>", sender.as_deref().unwrap_or_default())?;
                if let Some(size) = size {
                    write!(fmt, " SIZE={size}")?;
                }
                Ok(())
            }
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Help => fmt.write_str("HELP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTLS => fmt.write_str("STARTTLS"),
            // Initial responses carry credentials
            Self::Auth { mechanism, initial } => {
                write!(fmt, "AUTH {mechanism}")?;
                if initial.is_some() {
                    fmt.write_str(" ****")?;
                }
                Ok(())
            }
            Self::Invalid(s) | Self::Unrecognised(s) => fmt.write_str(s),
        }
    }
}

/// Split `<path> PARAM=value ...` into the path and its parameters.
fn split_path(args: &str) -> Option<(&str, &str)> {
    let args = args.trim_start();

    if let Some(rest) = args.strip_prefix('<') {
        let end = rest.find('>')?;
        Some((rest[..end].trim(), &rest[end + 1..]))
    } else {
        let end = args.find(char::is_whitespace).unwrap_or(args.len());
        Some((&args[..end], &args[end..]))
    }
}

fn parse_mail_from(command: &str, args: &str) -> Result<Command, Command> {
    let Some((path, params)) = split_path(args) else {
        return Err(Command::Invalid(command.to_owned()));
    };

    if path.is_empty() && !args.trim_start().starts_with('<') {
        return Err(Command::Invalid(command.to_owned()));
    }

    let mut size = None;
    for param in params.split_whitespace() {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        if key.eq_ignore_ascii_case("SIZE") {
            size = Some(
                value
                    .parse::<usize>()
                    .map_err(|_| Command::Invalid(command.to_owned()))?,
            );
        }
    }

    Ok(Command::MailFrom {
        sender: (!path.is_empty()).then(|| path.to_string()),
        size,
    })
}

fn parse_rcpt_to(command: &str, args: &str) -> Result<Command, Command> {
    match split_path(args) {
        Some((path, _)) if !path.is_empty() => Ok(Command::RcptTo(path.to_string())),
        _ => Err(Command::Invalid(command.to_owned())),
    }
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let command = command.trim_end_matches(['\r', '\n']);
        let trimmed = command.trim();
        let (verb, args) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(verb, args)| (verb, args.trim()));
        let verb = verb.to_ascii_uppercase();

        match verb.as_str() {
            "EHLO" | "HELO" if args.is_empty() => Err(Self::Invalid(command.to_owned())),
            "EHLO" => Ok(Self::Helo(HeloVariant::Ehlo(args.to_string()))),
            "HELO" => Ok(Self::Helo(HeloVariant::Helo(args.to_string()))),
            "MAIL" | "RCPT" => {
                let Some((keyword, rest)) = args.split_once(':') else {
                    return Err(Self::Invalid(command.to_owned()));
                };
                let keyword = keyword.trim();

                if verb == "MAIL" && keyword.eq_ignore_ascii_case("FROM") {
                    parse_mail_from(command, rest)
                } else if verb == "RCPT" && keyword.eq_ignore_ascii_case("TO") {
                    parse_rcpt_to(command, rest)
                } else {
                    Err(Self::Invalid(command.to_owned()))
                }
            }
            "AUTH" => {
                let mut parts = args.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(mechanism), initial, None) => Ok(Self::Auth {
                        mechanism: mechanism.to_ascii_uppercase(),
                        initial: initial.map(str::to_string),
                    }),
                    _ => Err(Self::Invalid(command.to_owned())),
                }
            }
            "DATA" if args.is_empty() => Ok(Self::Data),
            "QUIT" if args.is_empty() => Ok(Self::Quit),
            "STARTTLS" if args.is_empty() => Ok(Self::StartTLS),
            "RSET" if args.is_empty() => Ok(Self::Rset),
            "DATA" | "QUIT" | "STARTTLS" | "RSET" => Err(Self::Invalid(command.to_owned())),
            "NOOP" => Ok(Self::Noop),
            "HELP" => Ok(Self::Help),
            _ => Err(Self::Unrecognised(command.to_owned())),
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or(
            Err(Self::Unrecognised("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}
