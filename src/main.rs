// Proctoring client CLI
// Joins an exam room as host or candidate and drives it from stdin

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use proctor_client::analysis::Alert;
use proctor_client::api::HttpExamApi;
use proctor_client::config::Config;
use proctor_client::media::{CameraProvider, MediaProvider};
use proctor_client::proctor::{
    ComplianceSignal, ExamDeadline, FileWarningStore, HeadlessWindow, ProctorSession,
    SessionNotice, SessionOptions, SessionState, WarningCounter, WarningStore,
};
use proctor_client::room::{ExamRoom, PeerBroadcast, RoomEvent, RoomOptions, RtcPeerFactory};
use proctor_client::signaling::{Identity, Role, SignalingChannel};
use proctor_client::Result;

const DEFAULT_WARNING: &str = "Warning: Suspicious activity detected";

#[derive(Parser)]
#[command(name = "proctor")]
#[command(about = "Proctored exam client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join an exam room as host and watch candidates
    Host {
        /// Exam (room) ID
        #[arg(short, long)]
        exam_id: String,

        /// User ID (random if omitted)
        #[arg(short, long)]
        user_id: Option<String>,

        /// Display name (optional)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Sit an exam as candidate
    Candidate {
        /// Exam (room) ID
        #[arg(short, long)]
        exam_id: String,

        /// User ID (random if omitted)
        #[arg(short, long)]
        user_id: Option<String>,

        /// Display name (optional)
        #[arg(short, long)]
        name: Option<String>,

        /// Answer sheet ID reported on exit
        #[arg(short, long)]
        answer_id: String,

        /// Exam length in minutes
        #[arg(short, long, default_value_t = 60)]
        duration_mins: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let config = match Config::from_env().and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Host {
            exam_id,
            user_id,
            name,
        } => run_host(config, exam_id, identity(user_id, name, Role::Host)).await,
        Commands::Candidate {
            exam_id,
            user_id,
            name,
            answer_id,
            duration_mins,
        } => {
            run_candidate(
                config,
                exam_id,
                identity(user_id, name, Role::Candidate),
                answer_id,
                Duration::from_secs(duration_mins * 60),
            )
            .await
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` picks the filter; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn identity(user_id: Option<String>, name: Option<String>, role: Role) -> Identity {
    let user_id = user_id.unwrap_or_else(|| {
        let mut rng = rand::thread_rng();
        format!("user-{:06}", rng.gen_range(100000..999999))
    });
    Identity {
        user_id,
        role,
        name,
        email: None,
    }
}

fn room_options(config: &Config, exam_id: &str, identity: Identity) -> RoomOptions {
    RoomOptions {
        exam_id: exam_id.to_string(),
        identity,
        reconnect: config.reconnect.into(),
        frame_interval: config.proctor.frame_interval,
        analysis_history: config.proctor.analysis_history,
        warning: None,
    }
}

async fn run_host(config: Config, exam_id: String, identity: Identity) -> Result<()> {
    println!("{}", "Joining exam room as host...".cyan());
    println!("  Exam ID: {}", exam_id);
    println!("  User ID: {}", identity.user_id);

    let channel = SignalingChannel::new(config.signaling.clone());
    let factory = Arc::new(RtcPeerFactory::new(config.ice.clone())?);
    let (room, mut events) = ExamRoom::new(
        room_options(&config, &exam_id, identity),
        channel,
        factory,
        None,
    );
    room.start().await?;

    println!("\n{}", "Commands:".bold());
    println!("  terminate <socket>   End a candidate's exam");
    println!("  msg <socket> <text>  Message a candidate");
    println!("  warn <socket> [text] Issue a formal warning");
    println!("  list                 Show connected candidates");
    println!("  quit                 Leave the room\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_room_event(&event),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !host_command(&room, line.trim()).await {
                        break;
                    }
                }
                _ => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    room.shutdown().await;
    println!("{}", "Left exam room".cyan());
    Ok(())
}

/// Returns false when the user asked to quit.
async fn host_command(room: &ExamRoom, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("terminate") => match parts.next() {
            Some(socket_id) => report(room.terminate(socket_id).await, "Terminate sent"),
            None => println!("{}", "Usage: terminate <socket>".yellow()),
        },
        Some("msg") => match (parts.next(), parts.next()) {
            (Some(socket_id), Some(text)) => {
                report(room.message(socket_id, text).await, "Message sent")
            }
            _ => println!("{}", "Usage: msg <socket> <text>".yellow()),
        },
        Some("warn") => match parts.next() {
            Some(socket_id) => {
                let text = parts.next().unwrap_or(DEFAULT_WARNING);
                report(room.warn(socket_id, text).await, "Warning sent")
            }
            None => println!("{}", "Usage: warn <socket> [text]".yellow()),
        },
        Some("list") => {
            let flagged = room.suspicious_activity();
            let peers = room.participants().await;
            if peers.is_empty() {
                println!("  (no peers)");
            }
            for peer in peers {
                let reports = flagged.iter().filter(|r| r.user_id == peer.user_id).count();
                let status = if peer.connected {
                    "connected".green()
                } else {
                    "connecting".yellow()
                };
                println!(
                    "  {} {} [{}] {} packets, warnings: {}, flagged: {}",
                    peer.socket_id,
                    peer.name,
                    status,
                    peer.packets_received,
                    peer.warning_level
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "-".into()),
                    reports
                );
            }
        }
        Some("quit") | Some("exit") => return false,
        Some("") | None => {}
        Some(other) => println!("{} Unknown command: {}", "?".yellow(), other),
    }
    true
}

async fn run_candidate(
    config: Config,
    exam_id: String,
    identity: Identity,
    answer_id: String,
    duration: Duration,
) -> Result<()> {
    println!("{}", "Joining exam as candidate...".cyan());
    println!("  Exam ID: {}", exam_id);
    println!("  User ID: {}", identity.user_id);

    let store: Arc<dyn WarningStore> =
        Arc::new(FileWarningStore::new(config.proctor.state_dir.clone())?);
    let warnings = WarningCounter::open(store, &exam_id)?;

    let mut options = room_options(&config, &exam_id, identity.clone());
    options.warning = Some(warnings.reader());

    let channel = SignalingChannel::new(config.signaling.clone());
    let factory = Arc::new(RtcPeerFactory::new(config.ice.clone())?);
    let camera: Arc<dyn MediaProvider> = Arc::new(CameraProvider::new(
        config.media.clone(),
        format!("candidate-{}", identity.user_id),
    ));
    let (room, mut room_events) = ExamRoom::new(options, channel, factory, Some(camera));

    let window = Arc::new(HeadlessWindow::new());
    let api = Arc::new(HttpExamApi::new(&config.api)?);
    let peers: Arc<dyn PeerBroadcast> = Arc::new(room.clone());
    let (session, mut notices) = ProctorSession::begin(
        SessionOptions {
            exam_id: exam_id.clone(),
            answer_id,
            warning_interval: config.proctor.warning_interval,
        },
        warnings,
        window.clone(),
        api,
        peers,
    )?;

    session.agree().await;
    room.start().await?;
    session.media_ready().await;
    session.start_exam().await?;
    session.arm_deadline(ExamDeadline::in_duration(duration)).await;

    println!("\n{}", "Commands:".bold());
    println!("  blur | focus         Lose or regain window focus");
    println!("  fs-exit | fs-enter   Leave or re-enter fullscreen");
    println!("  submit               Submit the exam");
    println!("  quit                 Leave without submitting\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = room_events.recv() => {
                print_room_event(&event);
                if let RoomEvent::PeerData { peer_id, message } = event {
                    session.handle_peer_message(&peer_id, message).await;
                }
            }
            Some(notice) = notices.recv() => {
                print_notice(&notice);
                if let SessionNotice::StateChanged(SessionState::Exited(_)) = notice {
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "blur" => session.signal(ComplianceSignal::FocusLost).await,
                    "focus" => session.signal(ComplianceSignal::FocusRegained).await,
                    "fs-exit" => {
                        window.set_fullscreen(false);
                        session.signal(ComplianceSignal::FullscreenExited).await;
                    }
                    "fs-enter" => {
                        window.set_fullscreen(true);
                        session.signal(ComplianceSignal::FullscreenEntered).await;
                    }
                    "submit" => report(session.submit().await, "Exam submitted"),
                    "quit" | "exit" => break,
                    "" => {}
                    other => println!("{} Unknown command: {}", "?".yellow(), other),
                },
                _ => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    room.shutdown().await;
    println!("{}", "Left exam".cyan());
    Ok(())
}

fn report(result: Result<()>, success: &str) {
    match result {
        Ok(()) => println!("{} {}", "✓".green(), success),
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

fn print_room_event(event: &RoomEvent) {
    match event {
        RoomEvent::StateChanged(state) => println!("{} Room {:?}", "•".cyan(), state),
        RoomEvent::ParticipantJoined(p) => {
            println!("{} {} joined as {} ({})", "+".green(), p.display_name(), p.role(), p.socket_id)
        }
        RoomEvent::ParticipantLeft(socket_id) => println!("{} {} left", "-".yellow(), socket_id),
        RoomEvent::RemoteStream(stream) => println!(
            "{} Receiving media from {} ({} tracks)",
            "▶".green(),
            stream.peer_id(),
            stream.tracks().len()
        ),
        RoomEvent::PeerData { peer_id, message } => {
            println!("{} {}: {}", "✉".cyan(), peer_id, message)
        }
        RoomEvent::WarningLevel { peer_id, level } => {
            println!("{} {} is at warning level {}", "⚠".yellow(), peer_id, level)
        }
        RoomEvent::Alert(alert) => print_alert(alert),
        RoomEvent::ReconnectFailed { attempts } => println!(
            "{} Could not reconnect after {} attempts",
            "✗".red(),
            attempts
        ),
        RoomEvent::PermissionDenied(reason) => {
            println!("{} Camera or microphone unavailable: {}", "✗".red(), reason)
        }
    }
}

fn print_alert(alert: &Alert) {
    match alert {
        Alert::FlaggedFrame(activity) => println!(
            "{} Frame flagged ({:.0}%): {}",
            "⚠".yellow(),
            activity.confidence * 100.0,
            activity.reasons.join(", ")
        ),
        Alert::SuspiciousActivity(record) => println!(
            "{} Suspicious activity from {}: {}",
            "⚠".yellow(),
            record.user_id,
            record.reasons.join(", ")
        ),
        Alert::AutomatedWarning { user_id, .. } => {
            println!("{} Automated warning issued to {}", "⚠".yellow(), user_id)
        }
        Alert::HostWarning {
            message,
            warning_count,
        } => println!("{} Warning #{}: {}", "⚠".yellow(), warning_count, message),
        Alert::Disqualified { user_id } => {
            println!("{} {} was disqualified", "✗".red(), user_id)
        }
        Alert::CandidateDisconnected {
            user_id, reason, ..
        } => println!("{} {} disconnected: {}", "•".cyan(), user_id, reason),
    }
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        SessionNotice::StateChanged(state) => println!("{} Session {:?}", "•".cyan(), state),
        SessionNotice::WarningLevel(level) => {
            println!("{} Warning level is now {}", "⚠".yellow(), level)
        }
        SessionNotice::HostMessage { peer_id, text } => {
            println!("{} Message from {}: {}", "✉".cyan(), peer_id, text)
        }
        SessionNotice::TimeReminder { minutes_left } => {
            println!("{} {} minutes left", "⏰".yellow(), minutes_left)
        }
    }
}
