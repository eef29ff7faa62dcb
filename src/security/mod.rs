pub mod encryption;
pub mod pii;

pub use encryption::{DataEncryptor, TenantKeyManager};
pub use pii::PiiScrubber;
