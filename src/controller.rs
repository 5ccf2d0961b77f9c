use std::{future::Future, sync::Arc};

use tokio::sync::broadcast;

use crate::{
    config::Config, gateway::Gateway, internal, listener::Listener, logging, tls, Signal,
};

/// Owns the process lifetime: builds the gateway, runs the listener and
/// turns an interrupt into an orderly shutdown.
pub struct Controller {
    config: Config,
}

/// Resolves on CTRL+C, or SIGTERM where available.
async fn interrupted() {
    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    internal!(level = WARN, "Unable to listen for SIGTERM: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            () = terminate => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

impl Controller {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run this controller, and everything it controls, until interrupted.
    ///
    /// # Errors
    ///
    /// This function will return an error if the TLS material cannot be
    /// loaded or the listening socket cannot be bound.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        self.run_until(interrupted()).await
    }

    /// As [`Controller::run`], with `shutdown` in place of the process
    /// signals. Logging is left to the caller.
    ///
    /// # Errors
    ///
    /// See [`Controller::run`]
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        internal!("Controller running");

        let listen = &self.config.listen;
        let acceptor = if listen.tls.is_configured() {
            Some(tls::acceptor(&listen.tls)?)
        } else {
            None
        };

        let gateway = Arc::new(Gateway::from_config(&self.config));
        let listener = Listener::bind(listen, Arc::clone(&gateway), acceptor).await?;

        internal!(
            level = INFO,
            "Relaying mail from {} through {}",
            listener.local_addr()?,
            self.config.send.address()
        );

        let (sender, receiver) = broadcast::channel(64);
        let serve = listener.serve(receiver);
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => {
                gateway.shutdown().await;
                return result;
            }
            () = shutdown => {}
        }

        internal!(
            level = INFO,
            "Shutdown requested -- interrupt again to force shutdown"
        );

        let _ = sender.send(Signal::Shutdown);

        tokio::select! {
            result = &mut serve => result?,
            () = interrupted() => internal!(level = WARN, "Forcing shutdown"),
        }

        internal!(level = INFO, "Shutting down...");
        gateway.shutdown().await;

        Ok(())
    }
}
