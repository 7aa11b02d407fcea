pub mod codec;
pub mod error;
pub mod frame;
pub mod reassembly;
pub mod xml;

pub use codec::{decode, encode_frame, encode_seq, Decoded};
pub use error::WireError;
pub use frame::{Frame, FrameType, SeqFrame};
pub use reassembly::Reassembler;
