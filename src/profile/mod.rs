//! Profile parsing, conversion and rendering

pub mod connection;
pub mod convert;
pub mod model;
pub mod parser;
pub mod render;

pub use connection::Connection;
pub use convert::{convert, from_text};
pub use model::{AuthKind, AuthRetry, FileSource, Profile, TlsAuth, TlsAuthMode, X509Check, X509Verify};
pub use parser::{ParseError, RawOptionTable, parse};
pub use render::{EngineOptions, escape};

use std::path::Path;

impl Profile {
    /// Read and convert a configuration file
    pub fn load(path: &Path) -> Result<Profile, LoadError> {
        let text = std::fs::read_to_string(path)?;
        let mut profile = from_text(&text)?;
        if profile.name == Profile::default().name {
            if let Some(stem) = path.file_stem() {
                profile.name = stem.to_string_lossy().into_owned();
            }
        }
        Ok(profile)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("Failed to read profile: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}
