use tokio::io::{AsyncRead, AsyncWrite};

use super::{reply, Event, Response, Session, COMMAND_LINE_LIMIT};
use crate::{
    incoming, internal,
    smtp::{command::Command, state::State},
    status::Status,
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Process one line (or one piece of an overlong line) from the client.
    pub(super) async fn receive(&mut self, line: Vec<u8>) -> Response {
        if matches!(self.context.state, State::Reading) {
            return self.handle_data_reception(&line).await;
        }

        let complete = line.ends_with(b"\n");

        if self.context.discarding {
            self.context.discarding = !complete;
            return (None, Event::ConnectionKeepAlive);
        }

        if !complete && line.len() >= COMMAND_LINE_LIMIT {
            self.context.discarding = true;
            return reply(Status::SyntaxError, "5.5.2 Error: line too long");
        }

        if let State::Auth(step) = &self.context.state {
            incoming!("<authentication response>");
            let step = step.clone();
            return self.continue_auth(step, &line);
        }

        let command = Command::try_from(line.as_slice()).unwrap_or_else(|e| e);

        incoming!("{command}");

        let response = self.handle_command(&command);

        internal!(level = DEBUG, "Transitioned to {:?}", self.context.state);

        response
    }

    /// Accumulate message content, undoing dot-stuffing, until the lone dot.
    async fn handle_data_reception(&mut self, line: &[u8]) -> Response {
        let at_line_start = self.context.line_start;
        self.context.line_start = line.ends_with(b"\n");

        if at_line_start && (line == b".\r\n" || line == b".\n") {
            return self.end_of_data().await;
        }

        let content = if at_line_start && line.first() == Some(&b'.') {
            &line[1..]
        } else {
            line
        };

        if self.context.oversized {
            return (None, Event::ConnectionKeepAlive);
        }

        let total = self.context.message.len().saturating_add(content.len());
        if self.config.max_size.is_some_and(|max| total > max) {
            internal!(
                level = INFO,
                "Message from {} exceeds {} bytes, discarding",
                self.peer,
                self.config.max_size.unwrap_or_default()
            );
            self.context.oversized = true;
            self.context.message = Vec::new();
            return (None, Event::ConnectionKeepAlive);
        }

        self.context.message.extend_from_slice(content);
        (None, Event::ConnectionKeepAlive)
    }

    async fn end_of_data(&mut self) -> Response {
        let message = std::mem::take(&mut self.context.message);
        let oversized = self.context.oversized;
        self.reset_transaction();

        if oversized {
            return reply(
                Status::ExceededStorage,
                format!(
                    "5.3.4 Error: message exceeds fixed maximum message size {}",
                    self.config.max_size.unwrap_or_default()
                ),
            );
        }

        internal!(
            level = DEBUG,
            "Received {} bytes from {}",
            message.len(),
            self.peer
        );

        let helo_state = std::mem::replace(&mut self.context.state, State::PostDot);
        let (status, text) = self.gateway.handle_message(&message).await;
        self.context.state = helo_state;

        reply(status, text)
    }
}
