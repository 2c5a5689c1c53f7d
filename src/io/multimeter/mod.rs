// src/io/multimeter/mod.rs
//
// UNI-T UT803 bench multimeter over RS-232.

pub mod codec;
pub mod reader;

pub use codec::{
    decode, decode_ascii, decode_packet, DecoderInput, MeasurementKind, MultimeterError,
    MultimeterRaw, MultimeterSample,
};
pub use reader::{
    serial_opener, MultimeterLink, MultimeterOpener, MultimeterPoller, RawSample,
    SerialMultimeterLink,
};
