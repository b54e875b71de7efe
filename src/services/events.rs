use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub const DOWNLOAD_ERROR: &str = "download-error";
pub const GAME_CLOSED: &str = "game-closed";
pub const GAME_LAUNCH_ERROR: &str = "game-launch-error";
pub const GAME_LAUNCH_SUCCESS: &str = "game-launch-success";

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AppEvent {
    pub event: String,
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct GameErrorPayload<'a> {
    pub game: &'a str,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GamePayload<'a> {
    pub game: &'a str,
}

/// Fire-and-forget event sink; the host writes whatever comes out of the
/// receiver to stdout.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit<P: Serialize>(&self, event: &str, payload: P) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("failed to encode {} payload: {}", event, err);
                return;
            }
        };
        if self
            .tx
            .send(AppEvent {
                event: event.to_string(),
                payload,
            })
            .is_err()
        {
            tracing::debug!("dropping {} event: no listener", event);
        }
    }

    pub fn game_error(&self, event: &str, game: &str, error: impl ToString) {
        self.emit(
            event,
            GameErrorPayload {
                game,
                error: error.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let (events, mut rx) = EventEmitter::channel();
        events.game_error(DOWNLOAD_ERROR, "Game", "boom");
        events.emit(GAME_CLOSED, GamePayload { game: "Game" });

        let first = rx.recv().await.expect("first event");
        assert_eq!(first.event, DOWNLOAD_ERROR);
        assert_eq!(first.payload, serde_json::json!({ "game": "Game", "error": "boom" }));
        assert_eq!(rx.recv().await.expect("second event").event, GAME_CLOSED);
    }
}
