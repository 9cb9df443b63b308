use callcoach_media::MediaError;
use callcoach_types::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("roomId and authorId are required")]
    FieldsRequired,

    #[error("Room does not exist")]
    NotFound,

    #[error("failed to create room")]
    CreateFailed(#[source] MediaError),
}

impl From<RoomError> for AppError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::FieldsRequired => {
                AppError::validation("ROOM_FIELDS_REQUIRED", err.to_string())
            }
            RoomError::NotFound => AppError::not_found("ROOM_NOT_FOUND", err.to_string()),
            RoomError::CreateFailed(cause) => {
                AppError::upstream("ROOM_CREATE_FAILED", "Failed to create room", cause)
            }
        }
    }
}
