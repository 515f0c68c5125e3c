#![deny(unsafe_code)]

//! # Overview
//!
//! `cmux_protocol` implements the line-oriented wire format spoken between
//! the `cmux` client and the `cmuxd` daemon, together with the tokeniser
//! that is shared by the daemon's configuration-file parser.  The crate is
//! intentionally small and has no I/O: callers hand it complete lines and
//! receive typed requests, responses, and tokens back.
//!
//! A protocol exchange consists of a greeting
//! (`HELLO USER='alice' TTY='/dev/pts/0'`), a single request line
//! (`CONNECT CONSOLE='web.*' OPTION=REGEX OPTION=FORCE`), and a response
//! (`OK CONSOLE='web1'` or `ERROR CODE=7 MESSAGE='…'`), after which the
//! connection degenerates into an opaque byte stream.  Keywords match
//! case-insensitively; values travel single- or double-quoted with
//! embedded quotes protected by the high-bit ("take-out") encoding
//! implemented in [`takeout`].

pub mod lexer;
pub mod takeout;
pub mod wire;

pub use lexer::{LexError, Lexer, Token};
pub use wire::{
    CommandVerb, ErrorCode, Greeting, Request, RequestOption, Response, WireError,
    DEFAULT_PORT, MAX_SOCK_LINE,
};
