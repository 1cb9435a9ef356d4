// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for handling shutdown signals during a run.

use crate::{cancel::CancellationToken, errors::SignalHandlerSetupError};
use tracing::debug;

/// Listens for signals that should end a run.
#[derive(Debug)]
pub struct SignalHandler {
    signals: Option<imp::Signals>,
}

impl SignalHandler {
    /// Creates a new `SignalHandler` that handles Ctrl-C and, on Unix, SIGHUP and SIGTERM.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Result<Self, SignalHandlerSetupError> {
        let signals = imp::Signals::new().map_err(SignalHandlerSetupError::new)?;
        Ok(Self {
            signals: Some(signals),
        })
    }

    /// Creates a new `SignalHandler` that never receives anything. Useful for tests.
    pub fn noop() -> Self {
        Self { signals: None }
    }

    /// Waits for the next signal.
    ///
    /// Returns `None` once no more signals can be received.
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => None,
        }
    }

    /// Cancels `token` when the first shutdown signal arrives, and returns that signal.
    pub async fn cancel_on_shutdown(mut self, token: CancellationToken) -> Option<ShutdownEvent> {
        let SignalEvent::Shutdown(event) = self.recv().await?;
        debug!("received {event:?}, cancelling run");
        token.cancel();
        Some(event)
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    /// Signals for SIGINT, SIGTERM and SIGHUP on Unix.
    #[derive(Debug)]
    pub(super) struct Signals {
        sigint: SignalWithDone,
        sighup: SignalWithDone,
        sigterm: SignalWithDone,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            let sigint = SignalWithDone::new(SignalKind::interrupt())?;
            let sighup = SignalWithDone::new(SignalKind::hangup())?;
            let sigterm = SignalWithDone::new(SignalKind::terminate())?;

            Ok(Self {
                sigint,
                sighup,
                sigterm,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<SignalEvent> {
            loop {
                tokio::select! {
                    recv = self.sigint.signal.recv(), if !self.sigint.done => {
                        match recv {
                            Some(()) => break Some(SignalEvent::Shutdown(ShutdownEvent::Interrupt)),
                            None => self.sigint.done = true,
                        }
                    }
                    recv = self.sighup.signal.recv(), if !self.sighup.done => {
                        match recv {
                            Some(()) => break Some(SignalEvent::Shutdown(ShutdownEvent::Hangup)),
                            None => self.sighup.done = true,
                        }
                    }
                    recv = self.sigterm.signal.recv(), if !self.sigterm.done => {
                        match recv {
                            Some(()) => break Some(SignalEvent::Shutdown(ShutdownEvent::Term)),
                            None => self.sigterm.done = true,
                        }
                    }
                    else => {
                        break None
                    }
                }
            }
        }
    }

    #[derive(Debug)]
    struct SignalWithDone {
        signal: Signal,
        done: bool,
    }

    impl SignalWithDone {
        fn new(kind: SignalKind) -> std::io::Result<Self> {
            let signal = signal(kind)?;
            Ok(Self {
                signal,
                done: false,
            })
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::signal::windows::{CtrlC, ctrl_c};

    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
        ctrl_c_done: bool,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            let ctrl_c = ctrl_c()?;
            Ok(Self {
                ctrl_c,
                ctrl_c_done: false,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<SignalEvent> {
            if self.ctrl_c_done {
                return None;
            }

            match self.ctrl_c.recv().await {
                Some(()) => Some(SignalEvent::Shutdown(ShutdownEvent::Interrupt)),
                None => {
                    self.ctrl_c_done = true;
                    None
                }
            }
        }
    }
}

/// A signal received by a [`SignalHandler`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalEvent {
    /// A signal that should end the run.
    Shutdown(ShutdownEvent),
}

/// A signal event that should cause a shutdown to happen.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGHUP.
    #[cfg(unix)]
    Hangup,

    /// SIGTERM.
    #[cfg(unix)]
    Term,

    /// SIGINT, or Ctrl-C on Windows.
    Interrupt,
}
