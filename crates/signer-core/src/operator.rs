//! Operator-facing prompts: PIN entry and transfer confirmation.
//!
//! Value never moves without a local yes from the operator. Both prompts
//! block on human input, so callers run them off the async runtime.
//!
//! Closures implement both traits, which is how tests script the operator:
//!
//! ```
//! use idcard_signer_core::operator::{ConfirmationGate, TransferSummary};
//! use idcard_signer_core::{Address, Result, U256};
//!
//! let always_no = |_: &TransferSummary| -> Result<bool> { Ok(false) };
//! let summary = TransferSummary::new(Address::zero(), U256::from(1u8), U256::from(1u8));
//! assert!(!always_no.confirm(&summary).unwrap());
//! ```

use std::fmt;
use std::io::{self, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use alloy_primitives::U256;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::token::Pin;
use crate::units::format_ether;

const PIN_PROMPT: &str = "PIN1 pin: ";

/// What the operator is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Recipient.
    pub to: Address,
    /// Amount in wei.
    pub value: U256,
    /// Gas price in wei.
    pub gas_price: U256,
}

impl TransferSummary {
    /// Creates a summary.
    #[must_use]
    pub const fn new(to: Address, value: U256, gas_price: U256) -> Self {
        Self {
            to,
            value,
            gas_price,
        }
    }
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Send {} to {} with gasPrice {}?",
            format_ether(self.value),
            self.to,
            self.gas_price
        )
    }
}

/// Blocking operator approval of a pending transfer.
pub trait ConfirmationGate: Send + Sync {
    /// Returns `true` only if the operator approved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Operator`] if the prompt itself fails.
    fn confirm(&self, summary: &TransferSummary) -> Result<bool>;
}

impl<F> ConfirmationGate for F
where
    F: Fn(&TransferSummary) -> Result<bool> + Send + Sync,
{
    fn confirm(&self, summary: &TransferSummary) -> Result<bool> {
        self(summary)
    }
}

/// Blocking PIN entry for a token slot.
pub trait PinEntry: Send + Sync {
    /// Reads the PIN for the slot with the given label.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Operator`] if the prompt fails.
    fn read_pin(&self, slot_label: &str) -> Result<Pin>;
}

impl<F> PinEntry for F
where
    F: Fn(&str) -> Result<Pin> + Send + Sync,
{
    fn read_pin(&self, slot_label: &str) -> Result<Pin> {
        self(slot_label)
    }
}

/// The controlling terminal as operator console.
///
/// Confirmations are read from stdin by a dedicated reader thread, so a
/// prompt that times out gives up cleanly instead of holding stdin. PINs are
/// read from the terminal device with echo off.
pub struct Terminal {
    input: Mutex<LineReader>,
    confirm_timeout: Duration,
}

impl Terminal {
    /// Starts the stdin reader. Each confirmation prompt waits at most
    /// `confirm_timeout` for an answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Operator`] if the reader thread cannot be spawned.
    pub fn new(confirm_timeout: Duration) -> Result<Self> {
        Ok(Self {
            input: Mutex::new(LineReader::spawn()?),
            confirm_timeout,
        })
    }
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("confirm_timeout", &self.confirm_timeout)
            .finish_non_exhaustive()
    }
}

impl ConfirmationGate for Terminal {
    fn confirm(&self, summary: &TransferSummary) -> Result<bool> {
        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stdout = io::stdout();
        ask_yes_no(
            &summary.to_string(),
            &mut input,
            &mut stdout,
            self.confirm_timeout,
        )
    }
}

impl PinEntry for Terminal {
    fn read_pin(&self, slot_label: &str) -> Result<Pin> {
        tracing::debug!(slot = slot_label, "prompting for PIN");
        rpassword::prompt_password(PIN_PROMPT)
            .map(Pin::new)
            .map_err(|e| Error::Operator(e.to_string()))
    }
}

type LineResult = io::Result<Option<String>>;

/// One line of operator input, or why there is none.
enum Line {
    Text(String),
    Eof,
    TimedOut,
}

/// Reads stdin one line per request, on its own thread.
///
/// A read requested by a prompt that has since given up stays outstanding;
/// the next prompt reuses it rather than queueing another read behind it.
struct LineReader {
    requests: mpsc::Sender<()>,
    lines: mpsc::Receiver<LineResult>,
    outstanding: bool,
}

impl LineReader {
    fn spawn() -> Result<Self> {
        let (requests, pending) = mpsc::channel::<()>();
        let (delivered, lines) = mpsc::channel::<LineResult>();

        thread::Builder::new()
            .name("operator-stdin".to_string())
            .spawn(move || {
                for () in pending {
                    let mut line = String::new();
                    let read = io::stdin()
                        .read_line(&mut line)
                        .map(|n| (n > 0).then_some(line));
                    if delivered.send(read).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| Error::Operator(format!("cannot start stdin reader: {e}")))?;

        Ok(Self::from_channels(requests, lines))
    }

    fn from_channels(
        requests: mpsc::Sender<()>,
        lines: mpsc::Receiver<LineResult>,
    ) -> Self {
        Self {
            requests,
            lines,
            outstanding: false,
        }
    }

    /// Drops answers that were typed for a prompt that already timed out.
    fn discard_stale(&mut self) {
        if !self.outstanding {
            return;
        }
        while let Ok(stale) = self.lines.try_recv() {
            tracing::debug!(answered = stale.is_ok(), "discarding late operator input");
            self.outstanding = false;
        }
    }

    fn next_line(&mut self, deadline: Instant) -> Result<Line> {
        if !self.outstanding {
            self.requests.send(()).map_err(|_| reader_stopped())?;
            self.outstanding = true;
        }

        let wait = deadline.saturating_duration_since(Instant::now());
        match self.lines.recv_timeout(wait) {
            Ok(read) => {
                self.outstanding = false;
                match read.map_err(|e| Error::Operator(e.to_string()))? {
                    Some(text) => Ok(Line::Text(text)),
                    None => Ok(Line::Eof),
                }
            }
            Err(RecvTimeoutError::Timeout) => Ok(Line::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(reader_stopped()),
        }
    }
}

fn reader_stopped() -> Error {
    Error::Operator("stdin reader stopped".to_string())
}

/// Asks a `[y/n]` question until it gets an answer or `timeout` passes.
/// End of input declines.
fn ask_yes_no<W: Write>(
    question: &str,
    input: &mut LineReader,
    output: &mut W,
    timeout: Duration,
) -> Result<bool> {
    let io_err = |e: io::Error| Error::Operator(e.to_string());
    let deadline = Instant::now() + timeout;

    input.discard_stale();
    loop {
        write!(output, "{question} [y/n]: ").map_err(io_err)?;
        output.flush().map_err(io_err)?;

        match input.next_line(deadline)? {
            Line::Text(line) => match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => {}
            },
            Line::Eof => {
                writeln!(output).map_err(io_err)?;
                return Ok(false);
            }
            Line::TimedOut => {
                writeln!(output).map_err(io_err)?;
                writeln!(output, "Confirmation timed out, transfer dropped: {question}")
                    .map_err(io_err)?;
                output.flush().map_err(io_err)?;
                return Err(Error::Timeout("operator confirmation"));
            }
        }
    }
}
