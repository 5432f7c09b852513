pub mod codec;
pub mod reply;
pub mod request;
pub mod settings;
pub mod verb;

pub use codec::RecordCodec;
pub use reply::Reply;
pub use request::Request;
pub use settings::{Settings, decode_settings, encode_settings};
pub use verb::Verb;
