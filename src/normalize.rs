use crate::message::{Message, RecipientField};

fn flatten(field: Option<RecipientField>) -> Option<RecipientField> {
    field.map(|field| match field {
        RecipientField::AddressList(list) => RecipientField::PlainText(list.text()),
        text @ RecipientField::PlainText(_) => text,
    })
}

/// Force the fixed sender and flatten recipient headers to text.
///
/// No validation, deduplication or limits are applied. Applying it twice
/// yields the same message as applying it once.
#[must_use]
pub fn normalize(message: Message, sender: &str) -> Message {
    Message {
        from: Some(sender.to_string()),
        to: flatten(message.to),
        cc: flatten(message.cc),
        bcc: flatten(message.bcc),
        ..message
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::normalize;
    use crate::message::{Address, AddressList, Mailbox, Message, RecipientField};

    #[test]
    fn sender_and_lists() {
        let message = Message::parse(
            b"From: someone@example.net\r\nTo: \"Y\" <y@example.com>, z@example.com\r\nSubject: hi\r\n\r\nbody",
        )
        .unwrap();

        let normalized = normalize(message, "relay@example.org");

        assert_eq!(normalized.from.as_deref(), Some("relay@example.org"));
        assert_eq!(
            normalized.to,
            Some(RecipientField::PlainText(
                r#""Y" <y@example.com>, z@example.com"#.to_string()
            ))
        );
        assert_eq!(normalized.cc, None);
        assert_eq!(normalized.bcc, None);
        assert_eq!(normalized.subject.as_deref(), Some("hi"));
        assert_eq!(normalized.body, b"body");
    }

    #[test]
    fn plain_text_is_untouched() {
        let message = Message {
            from: None,
            to: Some(RecipientField::PlainText("undisclosed-recipients:;".to_string())),
            ..Message::default()
        };

        let normalized = normalize(message.clone(), "relay@example.org");

        assert_eq!(normalized.to, message.to);
        assert_eq!(normalized.from.as_deref(), Some("relay@example.org"));
    }

    fn mailbox() -> impl Strategy<Value = Mailbox> {
        (
            proptest::option::of("[A-Za-z][A-Za-z ]{0,10}[A-Za-z]"),
            "[a-z]{1,8}@[a-z]{1,8}\\.(com|org|net)",
        )
            .prop_map(|(name, address)| Mailbox { name, address })
    }

    fn field() -> impl Strategy<Value = Option<RecipientField>> {
        proptest::option::of(prop_oneof![
            "[ -~]{0,30}".prop_map(RecipientField::PlainText),
            proptest::collection::vec(mailbox(), 1..4).prop_map(|boxes| {
                RecipientField::AddressList(AddressList(
                    boxes.into_iter().map(Address::Mailbox).collect(),
                ))
            }),
        ])
    }

    proptest! {
        #[test]
        fn idempotent(to in field(), cc in field(), bcc in field(), sender in "[a-z]{1,8}@example\\.com") {
            let message = Message { to, cc, bcc, ..Message::default() };

            let once = normalize(message, &sender);
            let twice = normalize(once.clone(), &sender);

            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(once.from.as_deref(), Some(sender.as_str()));
            for field in [&once.to, &once.cc, &once.bcc].into_iter().flatten() {
                prop_assert!(matches!(field, RecipientField::PlainText(_)));
            }
        }
    }
}
