use serenity::http::error::Error as HttpError;
use thiserror::Error;

/// Errors raised while driving playback. The `Display` text of the
/// caller-facing variants is what ends up in chat.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Join a voice channel first.")]
    NotInVoiceChannel,

    #[error("You need to be in my voice channel.")]
    WrongVoiceChannel,

    #[error("I'm not connected.")]
    NotConnected,

    #[error("I need `CONNECT` and `SPEAK` permissions.")]
    MissingPermissions,

    #[error("I'm not playing anything.")]
    NothingPlaying,

    #[error("Couldn't find anything!")]
    ResolutionFailed,

    /// The now-playing message was removed by someone else.
    #[error("The now playing message no longer exists.")]
    DisplayStale,

    #[error("Authentication failed. Please check your Lavalink password.")]
    BackendAuthFailed,

    #[error("Voice connection failed: {0}")]
    Voice(String),

    #[error("Audio backend error: {0}")]
    Backend(String),

    #[error("Discord error: {0}")]
    Discord(#[from] serenity::Error),

    #[error("Audio node request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed audio node payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type PlayerResult<T> = Result<T, PlayerError>;

impl PlayerError {
    /// Maps a failed edit/delete of a message to `DisplayStale` when Discord
    /// says the message is gone.
    pub fn from_message_edit(why: serenity::Error) -> Self {
        if is_not_found(&why) {
            PlayerError::DisplayStale
        } else {
            PlayerError::Discord(why)
        }
    }
}

fn is_not_found(why: &serenity::Error) -> bool {
    if let serenity::Error::Http(error) = why {
        let error: &HttpError = error;

        if let HttpError::UnsuccessfulRequest(response) = error {
            return response.status_code.as_u16() == 404;
        }
    }

    false
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Expected `{0}` in the environment")]
    Missing(&'static str),

    #[error("Invalid value `{value}` for `{name}`")]
    Invalid { name: &'static str, value: String },
}
