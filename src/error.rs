//! Error type shared by the pool, the command backends and the pipeline.

pub type Result<T> = std::result::Result<T, ExposureError>;

#[derive(thiserror::Error, Debug)]
pub enum ExposureError {
    #[error("render target pool exhausted ({capacity} live targets)")]
    PoolExhausted { capacity: usize },

    #[error("invalid render target descriptor: {width}x{height} {format:?}")]
    InvalidDescriptor {
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    },

    #[error("invalid post-process settings: {0}")]
    InvalidSettings(String),

    #[error("{stage} ran without its input: {input}")]
    MissingInput {
        stage: &'static str,
        input: &'static str,
    },

    #[error("unknown render target #{0}")]
    UnknownTarget(u64),

    #[error("device error: {0}")]
    Device(String),

    #[error("readback error: {0}")]
    Readback(String),

    #[error("settings parse error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ExposureError {
    pub fn invalid_settings(msg: impl Into<String>) -> Self {
        Self::InvalidSettings(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn readback(msg: impl Into<String>) -> Self {
        Self::Readback(msg.into())
    }

    /// Whether the error aborts only the current frame. Configuration errors
    /// keep failing until the caller fixes the settings.
    pub fn is_frame_fatal(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::InvalidDescriptor { .. }
                | Self::MissingInput { .. }
                | Self::UnknownTarget(_)
                | Self::Device(_)
                | Self::Readback(_)
        )
    }
}
