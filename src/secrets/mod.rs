pub mod codec;

pub use codec::{decode_cert_pair, encode_cert_pair, SecretCodec};
