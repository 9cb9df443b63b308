use callcoach_types::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("queue is closed")]
    QueueClosed,

    #[error("stream is closed")]
    StreamClosed,

    #[error("rtp error: {0}")]
    Rtp(String),

    #[error("audio codec error: {0}")]
    Codec(String),

    #[error("stt error: {0}")]
    Stt(String),

    #[error("llm error: {0}")]
    Llm(String),
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match &err {
            PipelineError::Stt(_) => AppError::upstream("STT_FAILED", err.to_string(), err),
            PipelineError::Llm(_) => AppError::upstream("LLM_FAILED", err.to_string(), err),
            PipelineError::QueueClosed | PipelineError::StreamClosed => {
                AppError::internal(err.to_string())
            }
            PipelineError::Rtp(_) | PipelineError::Codec(_) => {
                AppError::internal(err.to_string())
            }
        }
    }
}
