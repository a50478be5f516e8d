pub mod device;
mod error;
pub mod ledger;
mod registry;
pub mod session;
pub mod sink;

pub use device::{CpalDevice, DeviceStream, ManualDevice, OutputDevice};
pub use error::{AudioError, Result};
pub use ledger::{DeviceClass, UsageLedger, UsageSnapshot};
pub use registry::Registry;
pub use session::{
    ClientEndpoint, ClientEvent, ClientHandle, EosOutcome, Session, SessionState, StreamType,
};
pub use sink::{
    AudioSink, CaptureSink, DecodeEvent, DeliveryCallback, LiveSink, OutputFlags, SampleFormat,
    SinkConfig, SinkHandle,
};
