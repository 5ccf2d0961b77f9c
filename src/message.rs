//! Parsed message model.
//!
//! Only the header section is interpreted; the body is carried through as
//! raw bytes. Recipient headers are kept either as structured address lists
//! or as plain text, see [`RecipientField`].

use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use mailparse::{MailAddr, MailAddrList, MailHeader, MailHeaderMap, SingleInfo};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Unable to parse message headers: {0}")]
    Parse(#[from] mailparse::MailParseError),

    #[error("Message has no header section")]
    NoHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: String,
}

impl Mailbox {
    #[must_use]
    pub fn new(name: Option<&str>, address: &str) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.to_string(),
        }
    }
}

impl From<SingleInfo> for Mailbox {
    fn from(info: SingleInfo) -> Self {
        Self {
            name: info.display_name.filter(|name| !name.is_empty()),
            address: info.addr,
        }
    }
}

/// UTF-8 bytes carried by one encoded word; 45 bytes keep the word under
/// the 75 character limit of RFC 2047.
const ENCODED_WORD_CHUNK: usize = 45;

/// A display phrase as header text. ASCII is quoted, anything else becomes a
/// run of RFC 2047 `B` encoded words so the header stays 7-bit.
fn write_phrase(f: &mut Formatter<'_>, phrase: &str, quote: bool) -> fmt::Result {
    if phrase.is_ascii() {
        if !quote {
            return f.write_str(phrase);
        }
        let escaped = phrase.replace('\\', "\\\\").replace('"', "\\\"");
        return write!(f, "\"{escaped}\"");
    }

    let mut start = 0;
    let mut chunks = Vec::new();
    for (offset, ch) in phrase.char_indices() {
        if offset + ch.len_utf8() - start > ENCODED_WORD_CHUNK {
            chunks.push(&phrase[start..offset]);
            start = offset;
        }
    }
    chunks.push(&phrase[start..]);

    for (idx, chunk) in chunks.into_iter().enumerate() {
        if idx > 0 {
            f.write_str(" ")?;
        }
        write!(f, "=?UTF-8?B?{}?=", base64::encode(chunk))?;
    }
    Ok(())
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => {
                write_phrase(f, name, true)?;
                write!(f, " <{}>", self.address)
            }
            None => f.write_str(&self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Mailbox(Mailbox),
    Group { name: String, members: Vec<Mailbox> },
}

impl From<MailAddr> for Address {
    fn from(addr: MailAddr) -> Self {
        match addr {
            MailAddr::Single(info) => Self::Mailbox(info.into()),
            MailAddr::Group(group) => Self::Group {
                name: group.group_name,
                members: group.addrs.into_iter().map(Mailbox::from).collect(),
            },
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mailbox(mailbox) => mailbox.fmt(f),
            Self::Group { name, members } => {
                write_phrase(f, name, false)?;
                f.write_str(":")?;
                for (idx, member) in members.iter().enumerate() {
                    f.write_str(if idx == 0 { " " } else { ", " })?;
                    member.fmt(f)?;
                }
                f.write_str(";")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AddressList(pub Vec<Address>);

impl AddressList {
    /// Flat text rendering. Re-parses to an equivalent list.
    #[must_use]
    pub fn text(&self) -> String {
        self.to_string()
    }

    pub fn mailboxes(&self) -> impl Iterator<Item = &Mailbox> {
        self.0.iter().flat_map(|address| match address {
            Address::Mailbox(mailbox) => core::slice::from_ref(mailbox).iter(),
            Address::Group { members, .. } => members.iter(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<MailAddrList> for AddressList {
    fn from(list: MailAddrList) -> Self {
        Self(list.iter().cloned().map(Address::from).collect())
    }
}

impl Display for AddressList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (idx, address) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            address.fmt(f)?;
        }
        Ok(())
    }
}

/// A `To`, `Cc` or `Bcc` header value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecipientField {
    PlainText(String),
    AddressList(AddressList),
}

impl RecipientField {
    /// Parse a header value as written on the wire, falling back to plain
    /// text when it is not an address list.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match mailparse::parse_header(format!("To: {value}").as_bytes()) {
            Ok((header, _)) => Self::from_header(&header),
            Err(_) => Self::PlainText(value.trim().to_string()),
        }
    }

    /// Encoded words are decoded into the address list. Plain text keeps the
    /// undecoded value unless it is not valid UTF-8.
    fn from_header(header: &MailHeader<'_>) -> Self {
        match mailparse::addrparse_header(header) {
            Ok(list) if !list.is_empty() => Self::AddressList(list.into()),
            _ => Self::PlainText(std::str::from_utf8(header.get_value_raw()).map_or_else(
                |_| header.get_value().trim().to_string(),
                |raw| raw.trim().to_string(),
            )),
        }
    }

    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Self::PlainText(text) => Cow::Borrowed(text.as_str()),
            Self::AddressList(list) => Cow::Owned(list.text()),
        }
    }

    /// Envelope addresses named by this field, in order.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        match self {
            Self::AddressList(list) => list.mailboxes().map(|m| m.address.clone()).collect(),
            Self::PlainText(text) => mailparse::addrparse(text).map_or_else(
                |_| Vec::new(),
                |list| {
                    AddressList::from(list)
                        .mailboxes()
                        .map(|m| m.address.clone())
                        .collect()
                },
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    /// Value bytes as received, folding preserved.
    pub value: Vec<u8>,
}

impl Header {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub from: Option<String>,
    pub to: Option<RecipientField>,
    pub cc: Option<RecipientField>,
    pub bcc: Option<RecipientField>,
    pub subject: Option<String>,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl Message {
    /// Parse the header section of a raw RFC 5322 message.
    ///
    /// # Errors
    /// If the header section is malformed or empty
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let (parsed, offset) = mailparse::parse_headers(raw)?;
        if parsed.is_empty() {
            return Err(MessageError::NoHeaders);
        }

        let recipients =
            |name: &str| parsed.get_first_header(name).map(RecipientField::from_header);

        Ok(Self {
            from: parsed.get_first_value("From"),
            to: recipients("To"),
            cc: recipients("Cc"),
            bcc: recipients("Bcc"),
            subject: parsed.get_first_value("Subject"),
            headers: parsed
                .iter()
                .map(|header| Header {
                    name: header.get_key(),
                    value: header.get_value_raw().to_vec(),
                })
                .collect(),
            body: raw[offset.min(raw.len())..].to_vec(),
        })
    }

    /// Upstream envelope recipients from `To`, `Cc` and `Bcc`, order kept,
    /// duplicates (ignoring case) dropped.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();

        for field in [&self.to, &self.cc, &self.bcc].into_iter().flatten() {
            for address in field.addresses() {
                if !seen.iter().any(|s| s.eq_ignore_ascii_case(&address)) {
                    seen.push(address);
                }
            }
        }

        seen
    }

    /// Render for transmission. `From`, `To` and `Cc` carry the model's
    /// values, `Bcc` is never written, other headers are copied byte for byte.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut lines: Vec<Vec<u8>> = Vec::with_capacity(self.headers.len() + 3);
        let (mut wrote_from, mut wrote_to, mut wrote_cc) = (false, false, false);

        let field = |name: &str, value: &str| format!("{name}: {value}").into_bytes();

        for header in &self.headers {
            if header.is("Bcc") {
                continue;
            } else if header.is("From") {
                if let Some(from) = self.from.as_deref().filter(|_| !wrote_from) {
                    lines.push(field("From", from));
                }
                wrote_from = true;
            } else if header.is("To") {
                if let Some(to) = self.to.as_ref().filter(|_| !wrote_to) {
                    lines.push(field("To", &to.text()));
                }
                wrote_to = true;
            } else if header.is("Cc") {
                if let Some(cc) = self.cc.as_ref().filter(|_| !wrote_cc) {
                    lines.push(field("Cc", &cc.text()));
                }
                wrote_cc = true;
            } else {
                let mut line = Vec::with_capacity(header.name.len() + header.value.len() + 2);
                line.extend_from_slice(header.name.as_bytes());
                line.extend_from_slice(b": ");
                line.extend_from_slice(&header.value);
                lines.push(line);
            }
        }

        if !wrote_from {
            if let Some(from) = &self.from {
                lines.insert(0, field("From", from));
            }
        }
        if !wrote_to {
            if let Some(to) = &self.to {
                lines.push(field("To", &to.text()));
            }
        }
        if !wrote_cc {
            if let Some(cc) = &self.cc {
                lines.push(field("Cc", &cc.text()));
            }
        }

        let mut bytes = Vec::with_capacity(self.body.len() + lines.len() * 64);
        for line in lines {
            bytes.extend_from_slice(&line);
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(&self.body);
        bytes
    }
}
