// Error type for frame encoding and decoding.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
