//! OS termination signals as a stream.
//!
//! The coordinator consumes any `Stream<Item = Signal>`, so tests can inject
//! signals through a channel while the binary listens to the real ones.

use core::fmt;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Streams every SIGINT (Ctrl+C) and SIGTERM delivered to the process.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed.
pub fn os_signals() -> std::io::Result<impl Stream<Item = Signal> + Send + Unpin + 'static> {
    let (tx, rx) = mpsc::unbounded_channel();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    Some(()) = terminate.recv() => Signal::Terminate,
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    else => break,
                };
                if tx.send(next).is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(Signal::Interrupt).is_err() {
                    break;
                }
            }
        });
    }

    Ok(UnboundedReceiverStream::new(rx))
}

/// A signal source driven by hand, for tests and embedding.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalSender {
    /// Delivers `signal`; returns `false` once the receiving side is gone.
    pub fn send(&self, signal: Signal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

/// Creates a manual signal source.
pub fn manual_signals() -> (
    SignalSender,
    impl Stream<Item = Signal> + Send + Unpin + 'static,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { tx }, UnboundedReceiverStream::new(rx))
}
