//! Wire-level SMTP types and framing.
//!
//! This crate holds everything that touches bytes on the wire without
//! touching a socket: command and reply grammars, envelope addresses,
//! MAIL/RCPT parameters, the xtext codec, the line buffer with its
//! terminator policies, and the dot-stuffing body codec.

pub use nom;

mod addr;
mod command;
mod dot;
mod linebuf;
mod params;
mod reply;
mod xtext;

pub use addr::{Email, Hostname};
pub use command::Command;
pub use dot::DotEscaper;
pub use linebuf::{LineBuffer, Scanned, Terminator};
pub use params::{BodyKind, MailParams, ParamError};
pub use reply::{Reply, ReplyCode, ReplyCodeKind};
pub use xtext::{xtext_decode, xtext_encode, XtextError};
