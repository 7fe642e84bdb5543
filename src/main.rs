use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use apx_assistant::db::{self, ConversationRepo};
use apx_assistant::voice::{
    AudioCapture, AudioPlayback, CaptureDevice, ConsolePlayback, MicrophoneCapture,
    PLAYBACK_SAMPLE_RATE, PlaybackDevice, SAMPLE_RATE, SpeakerPlayback, SpeechToText, SttProvider,
    TextToSpeech, TtsProvider, UnavailableCapture, calculate_energy,
};
use apx_assistant::{
    Config, ControlError, ControllerSettings, HttpTransport, LocalIdentity, Role, SessionClient,
    SessionContext, SessionController, SessionSnapshot, SessionState,
};

/// APX - voice and text emergency assistant
#[derive(Parser)]
#[command(name = "apx", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable microphone and spoken replies
    #[arg(long, env = "APX_TEXT_ONLY")]
    text_only: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Show stored conversations
    History {
        /// Show the exchanges of one conversation
        #[arg(short, long)]
        conversation: Option<String>,
        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,apx_assistant=info",
        1 => "info,apx_assistant=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&text).await,
            Command::History {
                conversation,
                limit,
            } => history(conversation.as_deref(), limit),
        };
    }

    let config = Config::load(cli.text_only)?;
    tracing::debug!(?config, "loaded configuration");

    interactive(config).await
}

/// Run one conversation session on stdin/stdout
async fn interactive(config: Config) -> anyhow::Result<()> {
    let user_id = LocalIdentity::resolve(&config.identity_path());
    let context = SessionContext::new(user_id);

    let (capture, playback) = build_devices(&config);
    let transport = Arc::new(HttpTransport::new(&config.backend.url, config.backend.timeout)?);

    let mut controller = SessionController::new(context, capture, playback, transport)
        .with_settings(ControllerSettings {
            turn_timeout: config.backend.timeout,
            cancel_grace: config.cancel_grace,
        });

    if config.persistence_enabled {
        match db::init(config.database_path()) {
            Ok(pool) => controller = controller.with_store(Arc::new(ConversationRepo::new(pool))),
            Err(e) => tracing::warn!(error = %e, "history unavailable, continuing without it"),
        }
    }

    let (client, session) = SessionClient::spawn(controller);
    let renderer = tokio::spawn(render(client.subscribe()));

    if config.voice.enabled {
        println!("Type a message, or /listen to speak. /cancel, /stop, /quit");
    } else {
        println!("Type a message. /cancel, /quit");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&client, &line).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    let _ = session.await;
    renderer.abort();

    Ok(())
}

/// Dispatch one input line; returns `false` to end the session
async fn handle_line(client: &SessionClient, line: &str) -> bool {
    let result = match line.trim() {
        "" => return true,
        "/quit" | "/exit" => return false,
        "/listen" => client.activate_capture().await,
        "/cancel" => client.cancel().await,
        "/stop" => client.cancel_playback().await,
        command if command.starts_with('/') => {
            println!("unknown command: {command}");
            return true;
        }
        text => client.submit_text(text).await,
    };

    match result {
        Ok(handle) => tracing::debug!(%handle, "command accepted"),
        Err(ControlError::SessionClosed) => return false,
        Err(e) => println!("({e})"),
    }
    true
}

/// Print transcript additions, state changes and notices as they are published
async fn render(mut snapshots: watch::Receiver<SessionSnapshot>) {
    let mut shown = 0;
    let mut last_state = SessionState::Idle;
    let mut last_notice = None;

    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();

        for turn in snapshot.transcript.iter().skip(shown) {
            match turn.role() {
                Role::User => println!("you> {}", turn.content()),
                Role::Assistant => println!("apx> {}", turn.content()),
            }
        }
        shown = snapshot.transcript.len();

        if snapshot.state != last_state {
            if snapshot.state == SessionState::Listening {
                println!("(listening...)");
            }
            last_state = snapshot.state;
        }

        if snapshot.notice != last_notice {
            if let Some(notice) = &snapshot.notice
                && notice.is_capture()
            {
                println!("({notice})");
            }
            last_notice = snapshot.notice;
        }
    }
}

/// Pick capture and playback adapters for the configured voice setup
fn build_devices(config: &Config) -> (Arc<dyn CaptureDevice>, Arc<dyn PlaybackDevice>) {
    if !config.voice.enabled {
        return (
            Arc::new(UnavailableCapture::new("voice disabled")),
            Arc::new(ConsolePlayback),
        );
    }

    let capture: Arc<dyn CaptureDevice> = match speech_to_text(config) {
        Ok(stt) => Arc::new(MicrophoneCapture::new(
            Arc::new(stt),
            config.voice.listen_timeout,
            config.voice.max_utterance,
        )),
        Err(e) => {
            tracing::warn!(error = %e, "speech input unavailable");
            Arc::new(UnavailableCapture::new(e.to_string()))
        }
    };

    let playback: Arc<dyn PlaybackDevice> = match text_to_speech(config) {
        Ok(tts) => Arc::new(SpeakerPlayback::new(Arc::new(tts), config.voice.volume)),
        Err(e) => {
            tracing::warn!(error = %e, "speech output unavailable, replies are text only");
            Arc::new(ConsolePlayback)
        }
    };

    (capture, playback)
}

fn speech_to_text(config: &Config) -> apx_assistant::Result<SpeechToText> {
    let key = match config.voice.stt_provider {
        SttProvider::Whisper => config.api_keys.openai.clone(),
        SttProvider::Deepgram => config.api_keys.deepgram.clone(),
    };
    SpeechToText::new(
        config.voice.stt_provider,
        key.unwrap_or_default(),
        config.voice.stt_model.clone(),
        config.voice.language.clone(),
    )
}

fn text_to_speech(config: &Config) -> apx_assistant::Result<TextToSpeech> {
    let key = match config.voice.tts_provider {
        TtsProvider::OpenAI => config.api_keys.openai.clone(),
        TtsProvider::ElevenLabs => config.api_keys.elevenlabs.clone(),
    };
    TextToSpeech::new(
        config.voice.tts_provider,
        key.unwrap_or_default(),
        config.voice.tts_voice.clone(),
        config.voice.tts_model.clone(),
        config.voice.speed,
    )
    .map(|tts| tts.with_pitch(config.voice.pitch))
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");
    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    // The input stream isn't Send, keep it on one blocking thread
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut capture = AudioCapture::new()?;
        capture.start()?;

        for i in 0..duration {
            std::thread::sleep(Duration::from_secs(1));

            let samples = capture.take_buffer();
            let energy = calculate_energy(&samples);
            let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy * 100.0).min(50.0) as usize;
            let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

            println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
        }

        capture.stop();
        Ok(())
    })
    .await??;

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    let num_samples = PLAYBACK_SAMPLE_RATE as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {PLAYBACK_SAMPLE_RATE} Hz...", samples.len());

    let end = tokio::task::spawn_blocking(move || {
        AudioPlayback::new(1.0)?.play_samples_blocking(samples, &CancellationToken::new())
    })
    .await??;
    tracing::debug!(?end, "tone finished");

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}

/// Test TTS output through the configured provider
async fn test_tts(text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load(false)?;
    let tts = text_to_speech(&config)?;
    let speaker = SpeakerPlayback::new(Arc::new(tts), config.voice.volume);

    println!("Synthesizing and playing...");
    speaker.speak(text, CancellationToken::new()).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// List stored conversations, or the exchanges of one
fn history(conversation: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let config = Config::load(true)?;
    let pool = db::init(config.database_path())?;
    let repo = ConversationRepo::new(pool);

    if let Some(id) = conversation {
        let records = repo.list_for_conversation(id, limit)?;
        if records.is_empty() {
            println!("No exchanges stored for {id}");
        }
        for record in records {
            println!(
                "[{}] ({}) you> {}",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.origin.as_str(),
                record.message
            );
            println!("{:>30} apx> {}", "", record.response);
        }
        return Ok(());
    }

    let summaries = repo.list_conversations(limit)?;
    if summaries.is_empty() {
        println!("No conversations stored yet");
    }
    for summary in summaries {
        println!(
            "{}  {:>3} exchanges  last {}",
            summary.conversation_id,
            summary.exchanges,
            summary.last_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}
