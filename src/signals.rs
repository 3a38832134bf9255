//! Signal translation for guest processes.
//!
//! A numeric signal from the manager is translated against the guest flavor
//! and the current signal capability into either a structured delivery
//! request or a hard-terminate directive.

use std::fmt;

use nix::sys::signal::Signal;

use crate::error::ShimError;

/// Operating system of the process inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFlavor {
    Linux,
    Windows,
}

impl fmt::Display for GuestFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestFlavor::Linux => write!(f, "linux"),
            GuestFlavor::Windows => write!(f, "windows"),
        }
    }
}

/// Named control signals understood by Windows-flavored guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowsSignal {
    CtrlC,
    CtrlBreak,
    CtrlClose,
    CtrlLogoff,
    CtrlShutdown,
    Kill,
    Terminate,
}

impl WindowsSignal {
    fn from_raw(signal: u32) -> Option<Self> {
        match signal {
            0 => Some(WindowsSignal::CtrlC),
            1 => Some(WindowsSignal::CtrlBreak),
            2 => Some(WindowsSignal::CtrlClose),
            5 => Some(WindowsSignal::CtrlLogoff),
            6 => Some(WindowsSignal::CtrlShutdown),
            9 => Some(WindowsSignal::Kill),
            15 => Some(WindowsSignal::Terminate),
            _ => None,
        }
    }
}

/// A structured signal request toward the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRequest {
    Posix { signal: u32 },
    Windows { signal: WindowsSignal },
}

/// Outcome of translating a numeric signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDecision {
    /// Deliver the structured request to the guest process.
    Deliver(SignalRequest),
    /// The capability set cannot express the signal; hard-terminate instead.
    Terminate,
}

/// Highest POSIX signal number accepted for Linux-flavored guests.
const SIGRTMAX: u32 = 64;

/// Translate `signal` for a guest of the given flavor.
///
/// With structured delivery supported, Linux guests accept any POSIX signal
/// and Windows guests accept only the named control-signal set. Without it,
/// only kill-intent signals are accepted and they become the hard-terminate
/// directive.
pub fn translate(
    signal: u32,
    flavor: GuestFlavor,
    supported: bool,
) -> Result<SignalDecision, ShimError> {
    if supported {
        let request = match flavor {
            GuestFlavor::Linux => {
                if !(1..=SIGRTMAX).contains(&signal) {
                    return Err(ShimError::InvalidSignal { signal, flavor });
                }
                SignalRequest::Posix { signal }
            }
            GuestFlavor::Windows => match WindowsSignal::from_raw(signal) {
                Some(named) => SignalRequest::Windows { signal: named },
                None => return Err(ShimError::InvalidSignal { signal, flavor }),
            },
        };
        return Ok(SignalDecision::Deliver(request));
    }

    let kill_intent = match flavor {
        GuestFlavor::Linux => {
            signal == Signal::SIGKILL as u32 || signal == Signal::SIGTERM as u32
        }
        GuestFlavor::Windows => matches!(
            WindowsSignal::from_raw(signal),
            Some(WindowsSignal::Kill | WindowsSignal::Terminate)
        ),
    };
    if kill_intent {
        Ok(SignalDecision::Terminate)
    } else {
        Err(ShimError::InvalidSignal { signal, flavor })
    }
}
