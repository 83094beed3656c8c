//! Line-oriented control protocol spoken with the DUT.
//!
//! Every request is a single newline-free ASCII line; every response is one
//! short token or an opaque payload. [`Request`] is the closed command set,
//! encoded through `Display` and decoded with a `winnow` grammar so both ends
//! of the wire can be exercised in tests.

use core::fmt;

use winnow::ascii::{Caseless, space0};
use winnow::combinator::{alt, eof, preceded, separated_pair, terminated};
use winnow::prelude::*;
use winnow::token::{rest, take_till};

use crate::report::Verdict;

/// Sensor name addressing every sensor at once.
pub const ALL_SENSORS: &str = "ALL";

/// Requested sensor power state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SensorPower {
    On,
    Off,
}

impl SensorPower {
    pub const fn as_token(self) -> &'static str {
        match self {
            SensorPower::On => "ON",
            SensorPower::Off => "OFF",
        }
    }
}

/// Commands understood by the DUT.
#[derive(Clone, Debug, PartialEq)]
pub enum Request<'a> {
    /// `EXTERNAL STORAGE?`: path of the DUT's external storage directory.
    ExternalStorage,
    /// `EXIT`: leave the DUT's connection loop.
    Exit,
    /// `RAISE <test> <message>`: report a fatal harness error.
    Raise { test: &'a str, message: &'a str },
    /// `USER RESPONSE <message>`: show a prompt and wait for the operator.
    UserResponse { message: &'a str },
    /// `SET TEST RESULT <test> <verdict> <message>`.
    SetTestResult {
        test: &'a str,
        verdict: Verdict,
        message: &'a str,
    },
    /// `SENSOR <ON|OFF> <sensor>`.
    SensorSwitch { power: SensorPower, sensor: &'a str },
    /// `SENSOR? <sensor>`: availability query.
    SensorAvailability { sensor: &'a str },
    /// `SCREEN OFF`.
    ScreenOff,
    /// `MESSAGE <message>`: show a message on the DUT.
    ShowMessage { message: &'a str },
}

/// Single-token field: spaces and line breaks become underscores.
struct Word<'a>(&'a str);

impl fmt::Display for Word<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ch in self.0.chars() {
            let ch = if ch.is_whitespace() { '_' } else { ch };
            fmt::Write::write_char(f, ch)?;
        }
        Ok(())
    }
}

/// Trailing free-text field: line breaks become spaces.
struct Text<'a>(&'a str);

impl fmt::Display for Text<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ch in self.0.chars() {
            let ch = if matches!(ch, '\r' | '\n') { ' ' } else { ch };
            fmt::Write::write_char(f, ch)?;
        }
        Ok(())
    }
}

impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::ExternalStorage => f.write_str("EXTERNAL STORAGE?"),
            Request::Exit => f.write_str("EXIT"),
            Request::Raise { test, message } => {
                write!(f, "RAISE {} {}", Word(test), Text(message))
            }
            Request::UserResponse { message } => write!(f, "USER RESPONSE {}", Text(message)),
            Request::SetTestResult {
                test,
                verdict,
                message,
            } => write!(
                f,
                "SET TEST RESULT {} {} {}",
                Word(test),
                verdict,
                Text(message)
            ),
            Request::SensorSwitch { power, sensor } => {
                write!(f, "SENSOR {} {}", power.as_token(), Word(sensor))
            }
            Request::SensorAvailability { sensor } => write!(f, "SENSOR? {}", Word(sensor)),
            Request::ScreenOff => f.write_str("SCREEN OFF"),
            Request::ShowMessage { message } => write!(f, "MESSAGE {}", Text(message)),
        }
    }
}

/// Failure to decode a request line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DecodeError {
    /// Byte offset at which decoding stopped.
    pub offset: usize,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed request at byte {}", self.offset)
    }
}

impl std::error::Error for DecodeError {}

impl<'a> Request<'a> {
    /// Encodes the request as a wire line (no terminator).
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decodes one wire line. A single trailing line terminator is tolerated.
    pub fn decode(line: &'a str) -> Result<Self, DecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        terminated(request, eof)
            .parse(line)
            .map_err(|error| DecodeError {
                offset: error.offset(),
            })
    }
}

fn word<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    take_till(1.., ' ').parse_next(input)
}

fn text<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    rest.parse_next(input)
}

fn verdict(input: &mut &str) -> ModalResult<Verdict> {
    take_till(1.., ' ')
        .verify_map(Verdict::from_token)
        .parse_next(input)
}

fn sensor_power(input: &mut &str) -> ModalResult<SensorPower> {
    alt(("ON".value(SensorPower::On), "OFF".value(SensorPower::Off))).parse_next(input)
}

fn request<'s>(input: &mut &'s str) -> ModalResult<Request<'s>> {
    alt((
        "EXTERNAL STORAGE?".value(Request::ExternalStorage),
        "EXIT".value(Request::Exit),
        preceded("RAISE ", separated_pair(word, ' ', text))
            .map(|(test, message)| Request::Raise { test, message }),
        preceded("USER RESPONSE ", text).map(|message| Request::UserResponse { message }),
        preceded(
            "SET TEST RESULT ",
            (word, ' ', verdict, ' ', text),
        )
        .map(|(test, _, verdict, _, message)| Request::SetTestResult {
            test,
            verdict,
            message,
        }),
        preceded("SENSOR? ", word).map(|sensor| Request::SensorAvailability { sensor }),
        preceded("SENSOR ", separated_pair(sensor_power, ' ', word))
            .map(|(power, sensor)| Request::SensorSwitch { power, sensor }),
        ("SCREEN OFF", space0).value(Request::ScreenOff),
        preceded("MESSAGE ", text).map(|message| Request::ShowMessage { message }),
    ))
    .parse_next(input)
}

/// Reply to a single request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    Ok,
    Err,
    Unavailable,
    /// Any other reply, e.g. a storage path.
    Payload(String),
}

impl Response {
    /// Decodes a raw response buffer. Invalid UTF-8 is replaced and
    /// surrounding whitespace and NUL padding are stripped.
    pub fn decode(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_matches(|ch: char| ch.is_whitespace() || ch == '\0');
        Self::from_token(text)
    }

    fn from_token(text: &str) -> Self {
        let mut token = text;
        let parsed: ModalResult<Response> = terminated(
            alt((
                Caseless("OK").value(Response::Ok),
                Caseless("ERR").value(Response::Err),
                Caseless("UNAVAILABLE").value(Response::Unavailable),
            )),
            eof,
        )
        .parse_next(&mut token);
        parsed.unwrap_or_else(|_| Response::Payload(text.to_string()))
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self, Response::Ok)
    }

    /// Payload text, if the reply was not a status token.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Response::Payload(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("OK"),
            Response::Err => f.write_str("ERR"),
            Response::Unavailable => f.write_str("UNAVAILABLE"),
            Response::Payload(text) => f.write_str(text),
        }
    }
}
