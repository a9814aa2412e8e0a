//! Integrity, confidentiality and admission control for the wire layer.

pub mod acl;
pub mod crypto;
pub mod signature;

pub use acl::{TrustedSubnet, REAL_IP_HEADER};
pub use crypto::{Decryptor, Encryptor};
pub use signature::{Signer, HASH_HEADER, HASH_METADATA};
