pub mod bitstream;
pub mod capture;
pub mod constants;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod sim;
pub mod sync;
pub mod transport;

pub use bitstream::{BitstreamLayout, TriggerBitstream};
pub use capture::{CaptureEngine, CaptureHandle, Sample, SimCaptureEngine};
pub use descriptor::{ChannelRecord, DescriptorBlob, DescriptorSpec, DescriptorTable};
pub use dispatcher::{Dispatcher, DispatcherConfig, Opcode, State};
pub use error::ProbeError;
pub use host::{ByteLink, HostLink, SerialLink};
pub use sim::{DeviceSim, SimConfig};
pub use transport::{SerialConfig, SerialTransport, Transport};
