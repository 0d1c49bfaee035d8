//! The console runner: video decode in the background, operator
//! commands from stdin, session reports to the log.
//!
//! ```text
//!  stdin ──► ConsoleCommand ──► ControlSession ──► broker
//!                                    │
//!  broker acks ──► SessionEvent ─────┴──► log / status
//!  StreamDecoder ──► frame + error callbacks ──► log
//! ```

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use opcon_core::session::{AckReport, SessionEvent};
use opcon_core::transport::TransportConfig;
use opcon_core::video::FfmpegFactory;
use opcon_core::{
    ChannelCodec, ChannelFields, ConsoleError, ControlSession, DeviceState, MqttLink,
    ProtocolError, ProtocolTransport, Reconciliation, StreamDecoder, ToggleControl, ToggleOutcome,
};

use crate::config::ConsoleConfig;
use crate::input::{ConsoleCommand, FanSetting, HELP};

/// What the loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    session: ControlSession,
    decoder: Option<StreamDecoder>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Console {
    /// Start video (if enabled) and connect the control session.
    pub async fn start(config: ConsoleConfig) -> Result<Self, ConsoleError> {
        let decoder = config.stream.enabled.then(|| start_video(&config));

        let (link, link_events) = MqttLink::new(&config.broker)?;
        let (transport, transport_events) = ProtocolTransport::new(
            Arc::new(link),
            link_events,
            TransportConfig::from_broker(&config.broker),
        );
        let (observer, events) = mpsc::unbounded_channel();
        let session = ControlSession::start(
            transport,
            transport_events,
            &config.broker,
            &config.rate_limit,
            config.device.clone(),
            observer,
        )
        .await?;

        info!("connecting to {}", config.broker.address);
        session.connect().await?;

        Ok(Self {
            session,
            decoder,
            events,
        })
    }

    /// Run until `quit`, end of input or Ctrl-C.
    pub async fn run(mut self) -> Result<(), ConsoleError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("type `help` for commands");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, shutting down");
                    break;
                }
                Some(event) = self.events.recv() => log_event(&event),
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("stdin closed");
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<ConsoleCommand>() {
                        Ok(cmd) => {
                            if self.execute(cmd).await == Flow::Quit {
                                break;
                            }
                        }
                        Err(e) => println!("{e}"),
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn execute(&mut self, cmd: ConsoleCommand) -> Flow {
        let result = match cmd {
            ConsoleCommand::Quit => return Flow::Quit,
            ConsoleCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            ConsoleCommand::Status => {
                self.print_status();
                Ok(())
            }
            ConsoleCommand::Pause => {
                match self.decoder.as_ref() {
                    Some(decoder) => decoder.pause(),
                    None => println!("video is disabled"),
                }
                Ok(())
            }
            ConsoleCommand::Resume => {
                match self.decoder.as_ref() {
                    Some(decoder) => decoder.resume(),
                    None => println!("video is disabled"),
                }
                Ok(())
            }
            ConsoleCommand::RelayToggle(index) => self
                .session
                .toggle_relay(index)
                .map(|mask| println!("relay selection {mask}")),
            ConsoleCommand::Relay(action) => self
                .session
                .send_relay(action)
                .await
                .map(|mask| info!("relay {action:?} sent {}", mask.to_hex())),
            ConsoleCommand::Send { channel, fields } => {
                self.session.send_fields(channel, &fields).await
            }
            other => {
                let device = self.session.device_snapshot();
                match command_fields(&other, &device, self.session.codec()) {
                    Some(fields) => self.session.send_command(fields).await,
                    None => Ok(()),
                }
            }
        };

        match result {
            Ok(()) => {}
            // Everything else already reached the observer.
            Err(ProtocolError::InvalidCommand(msg)) => println!("rejected: {msg}"),
            Err(e) => debug!("command not sent: {e}"),
        }
        Flow::Continue
    }

    fn print_status(&self) {
        let device = self.session.device_snapshot();
        println!("link:     {}", self.session.connection_phase());
        println!(
            "camera:   {}  fan: {}  brush: {}",
            on_off(device.camera.shown),
            on_off(device.fan.shown),
            if device.brush.shown { "up" } else { "down" },
        );
        println!(
            "relays:   selected {}  observed {}",
            device.relays.intent(),
            device.relays.observed()
        );
        println!(
            "motor:    speed {:?}  angle {:?} (reported {:?})",
            device.commanded_speed, device.commanded_angle, device.reported_angle
        );
        let pending = self.session.pending_channels();
        if !pending.is_empty() {
            let names: Vec<String> = pending.iter().map(ToString::to_string).collect();
            println!("awaiting: {}", names.join(", "));
        }
        match self.decoder.as_ref() {
            Some(decoder) => {
                let stats = decoder.stats();
                println!(
                    "video:    {} {}x{} {:.1} fps, {} frames{}",
                    decoder.state(),
                    stats.width,
                    stats.height,
                    stats.fps,
                    stats.total_frames,
                    if decoder.is_paused() { " (paused)" } else { "" },
                );
            }
            None => println!("video:    disabled"),
        }
    }

    async fn shutdown(mut self) -> Result<(), ConsoleError> {
        if let Some(mut decoder) = self.decoder.take() {
            tokio::task::spawn_blocking(move || decoder.stop())
                .await
                .map_err(|e| ConsoleError::Io(std::io::Error::other(e)))?;
        }
        self.session.shutdown().await?;
        Ok(())
    }
}

fn start_video(config: &ConsoleConfig) -> StreamDecoder {
    let mut decoder = StreamDecoder::new(FfmpegFactory {
        ffmpeg: config.stream.ffmpeg.clone(),
        ffprobe: config.stream.ffprobe.clone(),
    });

    let every = config.stream.stats_every;
    decoder.on_frame(move |frame| {
        if every > 0 && frame.sequence % every == 0 {
            info!(
                seq = frame.sequence,
                "video frame {}x{} ({} bytes)",
                frame.width,
                frame.height,
                frame.data.len()
            );
        }
    });
    decoder.on_error(|e| error!("video: {e}"));

    let session = config.stream_session();
    info!("opening {}", session.url);
    decoder.start(session);
    decoder
}

/// Map a device command onto the channel fields it sends.
fn command_fields(
    cmd: &ConsoleCommand,
    device: &DeviceState,
    codec: &ChannelCodec,
) -> Option<ChannelFields> {
    let step = codec.tuning().speed_delta;
    let turn = codec.tuning().angle_delta;
    let fields = match *cmd {
        ConsoleCommand::Camera(on) => ChannelFields::Camera { on },
        ConsoleCommand::Fan(FanSetting::State(state)) => codec.fan_command(state),
        ConsoleCommand::Fan(FanSetting::Duty(duty)) => ChannelFields::Pwm { duty },
        ConsoleCommand::Speed(speed) => codec.speed_command(speed),
        ConsoleCommand::Faster => codec.speed_command(device.commanded_speed.unwrap_or(0.0) + step),
        ConsoleCommand::Slower => codec.speed_command(device.commanded_speed.unwrap_or(0.0) - step),
        ConsoleCommand::Angle(angle) => codec.position_command(angle),
        ConsoleCommand::Left => codec.position_command(device.commanded_angle.unwrap_or(0.0) - turn),
        ConsoleCommand::Right => codec.position_command(device.commanded_angle.unwrap_or(0.0) + turn),
        ConsoleCommand::Brush(position) => codec.brush_command(position),
        _ => return None,
    };
    Some(fields)
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Ack(report) => info!("{}", describe(report)),
        SessionEvent::ProtocolError(e) if e.rate_limited => {
            warn!("command dropped (rate limited): {}", e.message());
        }
        SessionEvent::ProtocolError(e) => match e.channel {
            Some(channel) => error!("{channel}: {}", e.message()),
            None => error!("{}", e.message()),
        },
        SessionEvent::Connection(true) => info!("broker link up"),
        SessionEvent::Connection(false) => warn!("broker link lost, reconnecting"),
    }
}

/// One-line summary of an acknowledgement.
pub fn describe(report: &AckReport) -> String {
    let detail = match &report.reconciliation {
        None => "acknowledged".to_string(),
        Some(Reconciliation::Toggle { control, outcome }) => {
            let state = match (control, outcome.state()) {
                (ToggleControl::Brush, true) => "up",
                (ToggleControl::Brush, false) => "down",
                (_, true) => "on",
                (_, false) => "off",
            };
            match outcome {
                ToggleOutcome::Confirmed(_) => format!("{control:?} confirmed {state}"),
                ToggleOutcome::Flipped(_) => format!("{control:?} reported {state}, display updated"),
            }
        }
        Some(Reconciliation::RelayObserved(mask)) => format!("relays now {mask}"),
        Some(Reconciliation::SpeedRecorded(speed)) => format!("speed {speed}"),
        Some(Reconciliation::PositionReported(angle)) => format!("angle {angle}"),
    };
    format!("{} ack @ {}: {detail}", report.channel, report.acked_at)
}

fn on_off(state: bool) -> &'static str {
    if state { "on" } else { "off" }
}

// ── Tests ────────────────────────────────────────────────────────
