pub mod signature_v4;

pub use signature_v4::SignatureV4;
