pub mod amplifier;
pub mod clock;
pub mod error;
pub mod management;
pub mod settings;
