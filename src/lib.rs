pub mod ai;
pub mod assets;
pub mod audio;
pub mod bridge;
pub mod config;
pub mod decoder;
pub mod dump;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod transport;
pub mod xmacro;

pub use bridge::{CallBridge, CallDumps};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
