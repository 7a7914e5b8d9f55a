use thiserror::Error;

/// Library error type for dithering operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The execution environment cannot run the quantization kernel, or no
    /// kernel is configured. The effect stays disabled for the session.
    #[error("compute capability unavailable: {0}")]
    Capability(String),

    /// The palette is empty or one of its colors could not be parsed.
    #[error("invalid palette: {0}")]
    InvalidPalette(String),

    /// A resource was requested while the lifecycle holds nothing.
    #[error("dither resources are not active")]
    Inactive,

    /// Failure inside a backend while allocating, dispatching or copying.
    #[error("backend error: {0}")]
    Backend(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        let capability = Error::Capability("no adapter".into());
        assert_eq!(
            capability.to_string(),
            "compute capability unavailable: no adapter"
        );
        let backend = Error::Backend(anyhow::anyhow!("device lost"));
        assert_eq!(backend.to_string(), "backend error: device lost");
        assert_eq!(Error::Inactive.to_string(), "dither resources are not active");
    }
}
