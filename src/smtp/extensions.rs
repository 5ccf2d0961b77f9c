use core::fmt::{self, Display};

use crate::auth::Mechanism;

/// SMTP service extensions advertised in the EHLO reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    Pipelining,
    EightBitMime,
    SmtpUtf8,
    /// AUTH (RFC 4954), only listed while plaintext authentication is allowed.
    Auth(Vec<Mechanism>),
    /// SIZE (RFC 1870). `None` advertises the extension without a limit.
    Size(Option<usize>),
    /// STARTTLS (RFC 3207), only listed before the session is secured.
    Starttls,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::SmtpUtf8 => fmt.write_str("SMTPUTF8"),
            Self::Auth(mechanisms) => {
                fmt.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(fmt, " {mechanism}")?;
                }
                Ok(())
            }
            Self::Size(None) => fmt.write_str("SIZE"),
            Self::Size(Some(max)) => write!(fmt, "SIZE {max}"),
            Self::Starttls => fmt.write_str("STARTTLS"),
        }
    }
}

/// What a session currently permits, as far as EHLO is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertise {
    pub auth_allowed: bool,
    pub starttls_available: bool,
    pub max_size: Option<usize>,
    pub size_hidden: bool,
}

impl Advertise {
    #[must_use]
    pub fn extensions(self) -> Vec<Extension> {
        let mut extensions = vec![
            Extension::Pipelining,
            Extension::EightBitMime,
            Extension::SmtpUtf8,
        ];

        if self.auth_allowed {
            extensions.push(Extension::Auth(Mechanism::ALL.to_vec()));
        }

        if !self.size_hidden {
            extensions.push(Extension::Size(self.max_size));
        }

        if self.starttls_available {
            extensions.push(Extension::Starttls);
        }

        extensions
    }
}
