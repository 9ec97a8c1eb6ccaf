//! Configuration error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let config_err = Error::Config("request_limit must be greater than 0".into());
        assert_eq!(
            config_err.to_string(),
            "Configuration error: request_limit must be greater than 0"
        );

        let creds_err = Error::Credentials("missing password line".into());
        assert!(creds_err.to_string().contains("missing password line"));

        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        assert!(
            io_err.to_string().starts_with("I/O error:"),
            "got: {io_err}"
        );
    }

    #[test]
    fn toml_errors_convert() {
        let parse = toml::from_str::<toml::Table>("not = [valid").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Toml(_)));
    }
}
