//! Async host for a [`ConfCall`].
//!
//! Owns the controller on a tokio task: commands arrive over an mpsc
//! channel, timers are driven by a one-second tick, and controller events
//! are forwarded to the host over a second channel.

use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use huddle_core::{CallConfig, CallType, ClientId, IceServer, UserId, VideoState};
use huddle_roster::SeClient;
use huddle_signal::SignalMessage;

use crate::engine::ConfCall;
use crate::events::CallEvent;
use crate::media::MediaEvent;

/// Host → controller commands; one variant per imperative API.
#[derive(Debug)]
pub enum CallCommand {
    Start {
        call_type: CallType,
        audio_cbr: bool,
    },
    Answer {
        call_type: CallType,
        audio_cbr: bool,
    },
    Reject,
    End,
    SetConfig(CallConfig),
    AddTurnServer(IceServer),
    MsgRecv {
        curr_time: u64,
        msg_time: u64,
        from_user: UserId,
        from_client: ClientId,
        msg: Box<SignalMessage>,
    },
    SftMsgRecv {
        status: u32,
        msg: Option<Box<SignalMessage>>,
    },
    SetClients {
        clients: Vec<SeClient>,
        epoch: u32,
    },
    SetMediaKey {
        epoch: u32,
        key: Vec<u8>,
    },
    SetVstate(VideoState),
    RequestVideoStreams(Vec<(UserId, ClientId, u32)>),
    UpdateMuteState,
    Media(MediaEvent),
    Activate(bool),
    Restart,
}

/// Drive a controller until the command channel closes or `shutdown` fires.
///
/// Every controller event is forwarded to `events`; a closed event channel
/// stops the loop.
pub async fn run(
    mut call: ConfCall,
    mut commands: mpsc::Receiver<CallCommand>,
    events: mpsc::Sender<CallEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("call driver started");
    let started = Instant::now();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let now_ms = started.elapsed().as_millis() as u64;

        tokio::select! {
            _ = interval.tick() => {
                call.tick(now_ms);
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    info!("command channel closed, stopping driver");
                    break;
                };
                dispatch(&mut call, cmd, now_ms);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("call driver shutting down");
                    break;
                }
            }
        }

        for event in call.drain_events() {
            if events.send(event).await.is_err() {
                info!("event channel closed, stopping driver");
                return;
            }
        }
    }
}

fn dispatch(call: &mut ConfCall, cmd: CallCommand, now_ms: u64) {
    debug!(cmd = ?std::mem::discriminant(&cmd), "dispatching command");
    let result = match cmd {
        CallCommand::Start {
            call_type,
            audio_cbr,
        } => call.start(call_type, audio_cbr, now_ms),
        CallCommand::Answer {
            call_type,
            audio_cbr,
        } => call.answer(call_type, audio_cbr, now_ms),
        CallCommand::Reject => {
            call.reject();
            Ok(())
        }
        CallCommand::End => {
            call.end();
            Ok(())
        }
        CallCommand::SetConfig(cfg) => {
            call.set_config(cfg, now_ms);
            Ok(())
        }
        CallCommand::AddTurnServer(server) => call.add_turnserver(server),
        CallCommand::MsgRecv {
            curr_time,
            msg_time,
            from_user,
            from_client,
            msg,
        } => call.msg_recv(curr_time, msg_time, &from_user, &from_client, &msg, now_ms),
        CallCommand::SftMsgRecv { status, msg } => {
            call.sft_msg_recv(status, msg.as_deref(), now_ms)
        }
        CallCommand::SetClients { clients, epoch } => {
            call.set_clients(&clients, epoch, now_ms);
            Ok(())
        }
        CallCommand::SetMediaKey { epoch, key } => call.set_media_key(epoch, &key, now_ms),
        CallCommand::SetVstate(state) => {
            call.set_vstate(state);
            Ok(())
        }
        CallCommand::RequestVideoStreams(clients) => call.request_video_streams(&clients),
        CallCommand::UpdateMuteState => {
            call.update_mute_state();
            Ok(())
        }
        CallCommand::Media(event) => {
            call.media_event(event, now_ms);
            Ok(())
        }
        CallCommand::Activate(active) => {
            call.activate(active, now_ms);
            Ok(())
        }
        CallCommand::Restart => {
            call.restart();
            Ok(())
        }
    };

    if let Err(e) = result {
        error!(error = %e, code = e.code(), "command failed");
    }
}
