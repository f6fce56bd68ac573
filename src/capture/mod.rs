pub mod frame;
pub mod validator;

pub use frame::{DecodedFrame, FrameGeometry, WireFormat};
pub use validator::{FrameValidator, InboundBuffer};
