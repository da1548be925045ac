mod config;
mod output;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use callhub_core::CallStatus;
use callhub_logging::{init_file_logger, init_logger, mask_number};
use callhub_voice::{HistoryQuery, SimulatedEngine, VoiceSubsystem};

use config::CliConfig;
use output::{
    direction_label, format_duration, note_error, note_info, note_success, note_warn,
    render_table, status_label, Column,
};

#[derive(Parser)]
#[command(name = "callhub")]
#[command(about = "CallHub: place voice calls and browse call records")]
#[command(version)]
struct Cli {
    /// Identity used for tokens and history (overrides CALLHUB_IDENTITY)
    #[arg(long, global = true)]
    identity: Option<String>,
    /// Backend base URL (overrides CALLHUB_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call through the simulated engine
    Call {
        /// Number to dial
        number: String,
        /// Contact shown for the call
        #[arg(long)]
        contact: Option<String>,
        /// Seconds to stay connected before hanging up
        #[arg(long, default_value_t = 5)]
        hold_secs: u64,
        /// DTMF digits to send once connected
        #[arg(long)]
        digits: Option<String>,
        /// Mute right after connecting
        #[arg(long)]
        mute: bool,
    },
    /// List recorded calls
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        /// Filter by call status (completed, busy, ...)
        #[arg(long)]
        status: Option<String>,
        /// Filter by direction (inbound, outbound)
        #[arg(long = "type")]
        kind: Option<String>,
        /// Print the raw JSON page
        #[arg(long)]
        json: bool,
    },
    /// Show the transcript of a call
    Transcript {
        /// Call SID (CA + 32 hex digits)
        sid: String,
    },
    /// Show aggregate call statistics
    Stats,
    /// Check that the backend is reachable
    Health,
    /// Acquire an access token and show its lease
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::from_env().with_overrides(cli.identity, cli.server);

    match &config.log_dir {
        Some(dir) => init_file_logger(dir, &config.voice.log_level),
        None => init_logger(&config.voice.log_level),
    }

    let engine = Arc::new(SimulatedEngine::new().with_answer_delay(config.answer_delay));
    let voice = VoiceSubsystem::from_config(config.voice.clone(), engine)?;
    info!(
        identity = voice.identity(),
        server_url = voice.server_url(),
        "CallHub CLI starting"
    );

    match cli.command {
        Commands::Call {
            number,
            contact,
            hold_secs,
            digits,
            mute,
        } => {
            run_call(
                &voice,
                &number,
                contact.as_deref(),
                Duration::from_secs(hold_secs),
                digits.as_deref(),
                mute,
            )
            .await?
        }
        Commands::History {
            limit,
            offset,
            status,
            kind,
            json,
        } => {
            let query = HistoryQuery {
                limit: Some(limit),
                offset: Some(offset),
                status,
                kind,
            };
            let page = voice.get_call_history(query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else if page.calls.is_empty() {
                note_info("No calls recorded yet");
            } else {
                let columns = vec![
                    Column::left("SID"),
                    Column::left("Dir"),
                    Column::left("To"),
                    Column::left("Status"),
                    Column::right("Duration"),
                    Column::left("Started"),
                ];
                let rows: Vec<Vec<String>> = page
                    .calls
                    .iter()
                    .map(|call| {
                        vec![
                            call.call_sid.clone(),
                            direction_label(call.direction).to_string(),
                            call.to.as_deref().map(mask_number).unwrap_or_default(),
                            call.status.clone(),
                            format_duration(call.duration),
                            call.start_time
                                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                                .unwrap_or_default(),
                        ]
                    })
                    .collect();
                print!("{}", render_table(&columns, &rows));
                println!(
                    "  {} of {} (offset {}){}",
                    page.calls.len(),
                    page.pagination.total,
                    page.pagination.offset,
                    if page.pagination.has_more { ", more available" } else { "" }
                );
            }
        }
        Commands::Transcript { sid } => {
            let transcript = voice.get_call_transcript(&sid).await?;
            println!("Call:       {}", transcript.call_sid);
            println!("Status:     {}", transcript.status);
            println!("Duration:   {}", format_duration(transcript.duration));
            if let Some(url) = &transcript.recording_url {
                println!("Recording:  {url}");
            }
            println!();
            match &transcript.transcript {
                Some(text) => println!("{text}"),
                None => note_warn("Transcript not available yet"),
            }
        }
        Commands::Stats => {
            let stats = voice.get_call_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Health => {
            if voice.health_check().await {
                note_success(&format!("Backend at {} is healthy", voice.server_url()));
            } else {
                bail!("backend at {} is unreachable", voice.server_url());
            }
        }
        Commands::Token => {
            voice.leases().get_token(false).await?;
            match voice.leases().current_lease().await {
                Some(lease) => {
                    note_success(&format!("Token issued for {}", lease.identity));
                    println!("Expires at: {}", lease.expires_at.to_rfc3339());
                    println!("{lease:?}");
                }
                None => note_warn("No lease cached"),
            }
        }
    }

    Ok(())
}

async fn run_call(
    voice: &VoiceSubsystem,
    number: &str,
    contact: Option<&str>,
    hold: Duration,
    digits: Option<&str>,
    mute: bool,
) -> Result<()> {
    voice.initialize().await?;
    let session = voice.make_call(number, contact).await?;
    note_info(&format!(
        "Dialing {} [{}]",
        session.contact.name,
        session.sid.as_deref().unwrap_or("pending")
    ));

    let mut updates = voice.subscribe();
    let answered = tokio::time::timeout(
        Duration::from_secs(30),
        updates.wait_for(|s| s.status == CallStatus::Connected || s.status.is_terminal()),
    )
    .await
    .ok()
    .and_then(|seen| seen.ok().map(|snapshot| snapshot.status));

    match answered {
        Some(CallStatus::Connected) => {
            note_success(&format!("Connected ({})", status_label(CallStatus::Connected)));
            if mute {
                let muted = voice.toggle_mute().await;
                note_info(&format!("Muted: {muted}"));
            }
            if let Some(digits) = digits {
                if !voice.send_dtmf(digits).await {
                    note_warn("Digits were not sent");
                }
            }
            tokio::time::sleep(hold).await;
            let elapsed = voice.call_duration().await;
            voice.end_call().await;
            note_success(&format!(
                "Hung up after {}",
                format_duration(Some(elapsed.as_secs()))
            ));
        }
        Some(status) => {
            note_error(&format!(
                "Call ended as {}: {}",
                status_label(status),
                voice.error().unwrap_or_else(|| "no details".into())
            ));
        }
        None => {
            note_warn("No answer within 30s, giving up");
            voice.end_call().await;
        }
    }

    voice.teardown().await;
    println!("{}", serde_json::to_string_pretty(&voice.snapshot())?);
    Ok(())
}
