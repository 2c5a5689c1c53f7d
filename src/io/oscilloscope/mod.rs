// src/io/oscilloscope/mod.rs
//
// Networked oscilloscope: SCPI waveform capture and its gated poller.

pub mod adapter;
pub mod poller;

pub use adapter::{
    parse_preamble, read_tmc_block, ChannelCapture, ChannelSettings, OscilloscopeAdapter,
    OscilloscopeFrame, Preamble, ScpiOscilloscope,
};
pub use poller::{scpi_opener, CaptureGate, OscilloscopeOpener, OscilloscopePoller};
