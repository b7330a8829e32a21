pub mod cert;
pub mod error;
pub mod ocb2;

pub use error::CryptoError;
pub use ocb2::CryptState;
