//! Control channel: parsing of client commands and their dispatch against
//! the session.
//!
//! Requests arrive as percent-encoded JSON text, `{"type": "...", ...}`.
//! Type matching is case-insensitive. Every request produces exactly one
//! reply, JSON text of the shape `{"type": "...", "payload": ...}` (the
//! payload key is omitted when there is nothing to say). Unknown or
//! unparsable requests are answered with `BAD_REQUEST` echoing the
//! offending message; faults inside dispatch are answered with
//! `SERVER_ERROR` and logged, and never tear the channel down.

use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::camera::{CameraCommand, ControlSink};
use crate::session::SessionContext;

/// Exposure change per EXPOSURE_MORE / EXPOSURE_LESS, in microseconds.
pub const EXPOSURE_STEP_US: i64 = 500;
/// White balance change per WHITE_BALANCE_MORE / WHITE_BALANCE_LESS, kelvin.
pub const WHITE_BALANCE_STEP_K: i64 = 200;

/// Direction of a tuning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjust {
    More,
    Less,
}

impl Adjust {
    fn signed(self, step: i64) -> i64 {
        match self {
            Adjust::More => step,
            Adjust::Less => -step,
        }
    }
}

/// Which camera a tuning command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraTarget {
    Both,
    Cam1,
    Cam2,
}

/// The decoded command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    StreamClosed,
    Stitch,
    Toggle,
    RecordStart,
    RecordStop,
    Shutdown,
    WhiteBalance { adjust: Adjust, target: CameraTarget },
    Exposure { adjust: Adjust, target: CameraTarget },
}

#[derive(Debug, Error)]
pub enum ControlError {
    /// Not decodable as percent-encoded UTF-8 JSON.
    #[error("request is not valid percent-encoded JSON: {0}")]
    Malformed(String),
    /// Valid JSON, but no "type" field to dispatch on.
    #[error("request has no \"type\" field")]
    MissingType,
    /// A "type" outside the command table; carries it case-preserved.
    #[error("unknown command type {0:?}")]
    UnknownCommand(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Decode and parse one request. On success, also returns the type string
/// exactly as the client sent it.
pub fn parse_request(raw: &str) -> Result<(Command, String), ControlError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| ControlError::Malformed(e.to_string()))?;
    let envelope: Envelope =
        serde_json::from_str(&decoded).map_err(|e| ControlError::Malformed(e.to_string()))?;
    let kind = envelope.kind.ok_or(ControlError::MissingType)?;

    use {Adjust::*, CameraTarget::*};
    let command = match kind.to_ascii_uppercase().as_str() {
        "PING" => Command::Ping,
        "STREAM_CLOSED" => Command::StreamClosed,
        "STITCH" => Command::Stitch,
        "TOGGLE" => Command::Toggle,
        "RECORD_START" => Command::RecordStart,
        "RECORD_STOP" => Command::RecordStop,
        "SHUTDOWN" => Command::Shutdown,
        "WHITE_BALANCE_MORE" => Command::WhiteBalance { adjust: More, target: Both },
        "WHITE_BALANCE_LESS" => Command::WhiteBalance { adjust: Less, target: Both },
        "WHITE_BALANCE_MORE_CAM1" => Command::WhiteBalance { adjust: More, target: Cam1 },
        "WHITE_BALANCE_LESS_CAM1" => Command::WhiteBalance { adjust: Less, target: Cam1 },
        "WHITE_BALANCE_MORE_CAM2" => Command::WhiteBalance { adjust: More, target: Cam2 },
        "WHITE_BALANCE_LESS_CAM2" => Command::WhiteBalance { adjust: Less, target: Cam2 },
        "EXPOSURE_MORE" => Command::Exposure { adjust: More, target: Both },
        "EXPOSURE_LESS" => Command::Exposure { adjust: Less, target: Both },
        "EXPOSURE_MORE_CAM1" => Command::Exposure { adjust: More, target: Cam1 },
        "EXPOSURE_LESS_CAM1" => Command::Exposure { adjust: Less, target: Cam1 },
        "EXPOSURE_MORE_CAM2" => Command::Exposure { adjust: More, target: Cam2 },
        "EXPOSURE_LESS_CAM2" => Command::Exposure { adjust: Less, target: Cam2 },
        _ => return Err(ControlError::UnknownCommand(kind)),
    };
    Ok((command, kind))
}

/// What the channel task should do after sending the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    Continue,
    CloseChannel,
}

/// One handled request: the reply text plus the follow-up action.
#[derive(Debug)]
pub struct ControlOutcome {
    pub reply: String,
    pub action: ChannelAction,
}

fn reply_text(kind: &str, payload: Value) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("type".into(), Value::String(kind.into()));
    if !payload.is_null() {
        obj.insert("payload".into(), payload);
    }
    Value::Object(obj).to_string()
}

/// Executes commands against the session and the camera control sinks.
#[derive(Debug, Clone)]
pub struct ControlHandler {
    session: Arc<SessionContext>,
    sinks: Vec<ControlSink>,
}

impl ControlHandler {
    /// `sinks[0]` addresses camera 1, `sinks[1]` camera 2; single-camera
    /// sessions pass one sink and CAM2-targeted commands go nowhere.
    pub fn new(session: Arc<SessionContext>, sinks: Vec<ControlSink>) -> Self {
        Self { session, sinks }
    }

    /// Handle one raw request and produce exactly one reply.
    pub fn handle(&self, raw: &str) -> ControlOutcome {
        match parse_request(raw) {
            Ok((command, kind)) => match self.dispatch(command) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(kind = %kind, "command dispatch failed: {e:#}");
                    ControlOutcome {
                        reply: reply_text(
                            "SERVER_ERROR",
                            json!({
                                "message": "Something's wrong on the server side",
                                "error": e.to_string(),
                            }),
                        ),
                        action: ChannelAction::Continue,
                    }
                }
            },
            Err(ControlError::UnknownCommand(kind)) => {
                tracing::warn!(kind = %kind, "unknown control command");
                ControlOutcome {
                    reply: reply_text(
                        "BAD_REQUEST",
                        json!({
                            "message": format!("Unknown action type {kind}"),
                            "received": raw,
                        }),
                    ),
                    action: ChannelAction::Continue,
                }
            }
            Err(e) => {
                tracing::warn!("unparsable control request: {e}");
                ControlOutcome {
                    reply: reply_text(
                        "BAD_REQUEST",
                        json!({
                            "message": "Data passed to API is invalid",
                            "received": raw,
                            "error": e.to_string(),
                        }),
                    ),
                    action: ChannelAction::Continue,
                }
            }
        }
    }

    fn dispatch(&self, command: Command) -> anyhow::Result<ControlOutcome> {
        let mut action = ChannelAction::Continue;
        let reply = match command {
            Command::Ping => reply_text("PONG", Value::Null),
            Command::StreamClosed => {
                tracing::info!("client asked to close the control channel");
                action = ChannelAction::CloseChannel;
                reply_text("CLOSED_SUCCESSFUL", json!("Channel is closing..."))
            }
            Command::Stitch => {
                self.session.request_stitch();
                reply_text("STITCH", json!("Stitched images!"))
            }
            Command::Toggle => {
                let swapped = self.session.toggle_order();
                tracing::info!(swapped, "camera order toggled");
                reply_text("TOGGLE", json!("Toggle images!"))
            }
            Command::RecordStart => {
                self.session.set_recording(true);
                reply_text("RECORD_START", json!("Start recording video!"))
            }
            Command::RecordStop => {
                self.session.set_recording(false);
                reply_text("RECORD_STOP", json!("Stop recording video!"))
            }
            Command::Shutdown => {
                self.session.request_host_shutdown();
                reply_text("SHUTDOWN", json!("Shutting down host..."))
            }
            Command::WhiteBalance { adjust, target } => {
                let kelvin = self
                    .session
                    .adjust_white_balance(adjust.signed(WHITE_BALANCE_STEP_K));
                self.send_to(target, CameraCommand::ManualWhiteBalance { kelvin });
                reply_text("WHITE_BALANCE", json!(format!("White balance set to: {kelvin}")))
            }
            Command::Exposure { adjust, target } => {
                let (exposure_us, iso) = self
                    .session
                    .adjust_exposure(adjust.signed(EXPOSURE_STEP_US));
                self.send_to(target, CameraCommand::ManualExposure { exposure_us, iso });
                reply_text("EXPOSURE", json!(format!("Set exposure to: {exposure_us}")))
            }
        };
        Ok(ControlOutcome { reply, action })
    }

    fn send_to(&self, target: CameraTarget, command: CameraCommand) {
        for (i, sink) in self.sinks.iter().enumerate() {
            let wanted = match target {
                CameraTarget::Both => true,
                CameraTarget::Cam1 => i == 0,
                CameraTarget::Cam2 => i == 1,
            };
            if wanted {
                sink.send(command);
            }
        }
    }
}

/// Drive the control channel: one inbound request in, one reply out, until
/// the client closes, the transport drops, or the session is cancelled.
pub async fn run_control_channel(
    handler: ControlHandler,
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };

        let outcome = handler.handle(&message);
        if outbound.send(outcome.reply).await.is_err() {
            tracing::debug!("control reply channel gone");
            break;
        }
        if outcome.action == ChannelAction::CloseChannel {
            break;
        }
    }
    tracing::debug!("control channel task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{camera_channel, CameraFeed, CameraSource};
    use crate::session::TuningConfig;

    struct Fixture {
        handler: ControlHandler,
        session: Arc<SessionContext>,
        feed1: CameraFeed,
        feed2: CameraFeed,
        _source1: CameraSource,
        _source2: CameraSource,
    }

    fn fixture_with_tuning(tuning: TuningConfig) -> Fixture {
        let cancel = CancellationToken::new();
        let session = Arc::new(SessionContext::new(tuning, false, cancel.clone()));
        let (feed1, source1) = camera_channel(4, cancel.child_token());
        let (feed2, source2) = camera_channel(4, cancel.child_token());
        let handler = ControlHandler::new(
            Arc::clone(&session),
            vec![source1.control_sink(), source2.control_sink()],
        );
        Fixture {
            handler,
            session,
            feed1,
            feed2,
            _source1: source1,
            _source2: source2,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_tuning(TuningConfig::default())
    }

    fn parse_reply(outcome: &ControlOutcome) -> Value {
        serde_json::from_str(&outcome.reply).unwrap()
    }

    #[test]
    fn test_ping_pong() {
        let fx = fixture();
        let outcome = fx.handler.handle(r#"{"type":"PING"}"#);
        let reply = parse_reply(&outcome);

        assert_eq!(reply["type"], "PONG");
        assert!(reply.get("payload").is_none());
        assert_eq!(outcome.action, ChannelAction::Continue);
    }

    #[test]
    fn test_type_matching_is_case_insensitive() {
        let fx = fixture();
        let outcome = fx.handler.handle(r#"{"type":"ping"}"#);
        assert_eq!(parse_reply(&outcome)["type"], "PONG");

        let outcome = fx.handler.handle(r#"{"type":"Record_Start"}"#);
        assert_eq!(parse_reply(&outcome)["type"], "RECORD_START");
        assert!(fx.session.is_recording());
    }

    #[test]
    fn test_url_encoded_request_is_decoded() {
        let fx = fixture();
        let outcome = fx.handler.handle("%7B%22type%22%3A%22PING%22%7D");
        assert_eq!(parse_reply(&outcome)["type"], "PONG");
    }

    #[test]
    fn test_unknown_type_echoes_case_preserved() {
        let fx = fixture();
        let raw = r#"{"type":"Awb_Mode","value":1}"#;
        let outcome = fx.handler.handle(raw);
        let reply = parse_reply(&outcome);

        assert_eq!(reply["type"], "BAD_REQUEST");
        assert_eq!(reply["payload"]["message"], "Unknown action type Awb_Mode");
        assert_eq!(reply["payload"]["received"], raw);
        assert_eq!(outcome.action, ChannelAction::Continue);

        let outcome = fx.handler.handle(r#"{"type":"bogus"}"#);
        let reply = parse_reply(&outcome);
        assert_eq!(reply["type"], "BAD_REQUEST");
        assert_eq!(reply["payload"]["message"], "Unknown action type bogus");
    }

    #[test]
    fn test_near_miss_command_names_are_rejected() {
        let fx = fixture();
        for raw in [
            r#"{"type":"EXPOSURE_MORE_CAM3"}"#,
            r#"{"type":"WHITE_BALANCE"}"#,
            r#"{"type":"RECORD"}"#,
        ] {
            let outcome = fx.handler.handle(raw);
            assert_eq!(parse_reply(&outcome)["type"], "BAD_REQUEST", "{raw}");
        }
    }

    #[test]
    fn test_malformed_json_is_bad_request() {
        let fx = fixture();
        let raw = "not json at all";
        let outcome = fx.handler.handle(raw);
        let reply = parse_reply(&outcome);

        assert_eq!(reply["type"], "BAD_REQUEST");
        assert_eq!(reply["payload"]["message"], "Data passed to API is invalid");
        assert_eq!(reply["payload"]["received"], raw);
        assert!(reply["payload"]["error"].is_string());
    }

    #[test]
    fn test_missing_type_field_is_bad_request() {
        let fx = fixture();
        let outcome = fx.handler.handle(r#"{"hello":1}"#);
        assert_eq!(parse_reply(&outcome)["type"], "BAD_REQUEST");
    }

    #[test]
    fn test_exposure_steps_move_only_exposure() {
        let mut fx = fixture();

        let outcome = fx.handler.handle(r#"{"type":"EXPOSURE_MORE"}"#);
        let reply = parse_reply(&outcome);
        assert_eq!(reply["type"], "EXPOSURE");
        assert_eq!(reply["payload"], "Set exposure to: 20500");
        assert_eq!(fx.session.exposure(), (20_500, 800));

        // both cameras get the new absolute values
        assert_eq!(
            fx.feed1.try_command(),
            Some(CameraCommand::ManualExposure { exposure_us: 20_500, iso: 800 })
        );
        assert_eq!(
            fx.feed2.try_command(),
            Some(CameraCommand::ManualExposure { exposure_us: 20_500, iso: 800 })
        );

        // a step back restores the original value, ISO untouched throughout
        fx.handler.handle(r#"{"type":"EXPOSURE_LESS"}"#);
        assert_eq!(fx.session.exposure(), (20_000, 800));
    }

    #[test]
    fn test_targeted_exposure_reaches_only_that_camera() {
        let mut fx = fixture();

        fx.handler.handle(r#"{"type":"EXPOSURE_MORE_CAM1"}"#);
        assert_eq!(fx.session.exposure(), (20_500, 800));
        assert_eq!(
            fx.feed1.try_command(),
            Some(CameraCommand::ManualExposure { exposure_us: 20_500, iso: 800 })
        );
        assert_eq!(fx.feed2.try_command(), None);

        fx.handler.handle(r#"{"type":"EXPOSURE_LESS_CAM1"}"#);
        assert_eq!(fx.session.exposure(), (20_000, 800));
    }

    #[test]
    fn test_white_balance_targets_one_camera() {
        let mut fx = fixture();

        let outcome = fx.handler.handle(r#"{"type":"WHITE_BALANCE_MORE_CAM2"}"#);
        let reply = parse_reply(&outcome);
        assert_eq!(reply["type"], "WHITE_BALANCE");
        assert_eq!(reply["payload"], "White balance set to: 4200");

        assert_eq!(fx.feed1.try_command(), None);
        assert_eq!(
            fx.feed2.try_command(),
            Some(CameraCommand::ManualWhiteBalance { kelvin: 4200 })
        );
    }

    #[test]
    fn test_exposure_clamps_at_configured_range() {
        let fx = fixture_with_tuning(TuningConfig {
            exposure_range_us: Some(1_000..=20_400),
            ..TuningConfig::default()
        });

        fx.handler.handle(r#"{"type":"EXPOSURE_MORE"}"#);
        assert_eq!(fx.session.exposure(), (20_400, 800));

        // further steps hold at the bound
        fx.handler.handle(r#"{"type":"EXPOSURE_MORE"}"#);
        assert_eq!(fx.session.exposure(), (20_400, 800));
    }

    #[test]
    fn test_stream_closed_closes_channel_after_reply() {
        let fx = fixture();
        let outcome = fx.handler.handle(r#"{"type":"STREAM_CLOSED"}"#);
        let reply = parse_reply(&outcome);

        assert_eq!(reply["type"], "CLOSED_SUCCESSFUL");
        assert_eq!(reply["payload"], "Channel is closing...");
        assert_eq!(outcome.action, ChannelAction::CloseChannel);
    }

    #[test]
    fn test_session_flags_respond_to_commands() {
        let fx = fixture();

        fx.handler.handle(r#"{"type":"STITCH"}"#);
        assert!(fx.session.take_stitch_request());

        fx.handler.handle(r#"{"type":"TOGGLE"}"#);
        assert!(fx.session.order_swapped());
        fx.handler.handle(r#"{"type":"TOGGLE"}"#);
        assert!(!fx.session.order_swapped());

        fx.handler.handle(r#"{"type":"RECORD_START"}"#);
        assert!(fx.session.is_recording());
        fx.handler.handle(r#"{"type":"RECORD_STOP"}"#);
        assert!(!fx.session.is_recording());
    }

    #[tokio::test]
    async fn test_channel_task_replies_then_honors_close() {
        let fx = fixture();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_control_channel(
            fx.handler.clone(),
            in_rx,
            out_tx,
            cancel,
        ));

        in_tx.send(r#"{"type":"PING"}"#.to_string()).await.unwrap();
        let reply: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "PONG");

        in_tx
            .send(r#"{"type":"STREAM_CLOSED"}"#.to_string())
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "CLOSED_SUCCESSFUL");

        // the task ends on its own after the close command
        task.await.unwrap();
    }
}
