pub mod codec;
pub mod frame;

pub use codec::{consume_frames, decode, encode, ENVELOPE_HEADER_LEN, MAGIC, VERSION};
pub use frame::{
    AckPayload, CancelPayload, CompletePayload, DataPayload, EncryptedPayload, Frame, HelloAckPayload,
    HelloPayload, MetadataPayload, ResumePayload, VerifyPayload,
};
