use std::path::Path;
use std::sync::Arc;

use callcore::config::{read_app_config_with_path, ProfileConfig};
use callcore::controller::ConversationController;
use callcore::external::{HangupSink, TransferSink};
use callcore::llm::client::HttpLlmClient;
use callcore::llm::tools::{EndConversation, ScheduleFollowup, SendNotification, TransferConversation};
use callcore::llm::{TurnEngine, TurnEngineConfig};
use callcore::sender::PacedSender;
use callcore::stt::{HttpSttRecognizer, SttStreamer};
use callcore::tts::{HttpTtsSynthesizer, TtsStreamer, TtsSynthesizer};
use callcore::vad::VadSegmenter;

use clap::Parser;

#[derive(Parser)]
#[command(name = "callcore")]
#[command(about = "Real-time telephony voice-agent core")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file (defaults to ./callcore.toml or ./config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Profile name to activate; falls back to BOT_PROFILE, then the
    /// config file's active_profile
    #[arg(long)]
    profile: Option<String>,

    /// Logging verbosity (informational only; this crate logs via println!/eprintln!)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Sinks with no real SIP/RTP transport wired in: this crate is the
/// voice-agent core, not the SIP stack, so a standalone run logs the
/// actions a real transport layer would perform (spec.md §1, §6).
struct LoggingTransferSink;

#[async_trait::async_trait]
impl TransferSink for LoggingTransferSink {
    async fn transfer(&self, full_address: &str) -> bool {
        println!("transfer requested to {full_address} (no SIP transport attached)");
        true
    }
}

struct LoggingHangupSink;

impl HangupSink for LoggingHangupSink {
    fn hangup(&self) {
        println!("hangup requested (no SIP transport attached)");
    }
}

/// Ensure the profile's welcome audio WAV exists on disk, synthesizing it
/// once from `welcome_message_text` if missing (spec.md §6 "Persisted
/// state"). Returns PCMU-encoded bytes ready for
/// `ConversationController::start_call`.
fn ensure_welcome_audio(
    profile: &ProfileConfig,
    synth: &dyn TtsSynthesizer,
) -> anyhow::Result<Vec<u8>> {
    let path = Path::new(&profile.welcome_audio_path);

    if !path.exists() {
        println!(
            "Welcome audio not found at {:?}, synthesizing from configured text",
            path
        );
        let samples = synth
            .synthesize(&profile.welcome_message_text)
            .map_err(|e| anyhow::anyhow!("welcome audio synthesis failed: {e}"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        println!("Welcome audio written to {:?}", path);
    }

    let mut reader = hound::WavReader::open(path)?;
    let sample_rate = reader.spec().sample_rate;
    let pcm: Vec<u8> = reader
        .samples::<i16>()
        .filter_map(|s| s.ok())
        .flat_map(|s| s.to_le_bytes())
        .collect();
    let pcm8k = callcore::codec::resample_pcm16(&pcm, sample_rate, 8_000);
    Ok(callcore::codec::encode_mulaw(&pcm8k))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    println!("Log level: {} (informational; this crate logs via println!/eprintln!)", args.log_level);

    println!("Loading configuration...");
    let (app_config, config_path) =
        read_app_config_with_path(args.config.as_deref().map(Path::new));
    match &config_path {
        Some(path) => println!("Configuration loaded from {}", path.display()),
        None => println!("Configuration: using defaults (no config file found)"),
    }

    let profile_name = args
        .profile
        .or_else(|| std::env::var("BOT_PROFILE").ok())
        .unwrap_or_else(|| app_config.active_profile.clone());
    println!("Active profile: {profile_name}");

    let profile = app_config.profile(&profile_name).cloned().unwrap_or_else(|| {
        eprintln!("Profile {profile_name:?} not found in configuration, using defaults");
        ProfileConfig::default()
    });

    println!("Loading VAD model from {:?}", app_config.vad_model_path);
    let vad = VadSegmenter::new(app_config.vad.clone().into(), &app_config.vad_model_path, 20)
        .map_err(|e| anyhow::anyhow!("failed to load VAD model: {e}"))?;

    println!("Checking STT model at {:?}", app_config.stt.model_path);
    callcore::stt::ensure_model_downloaded(
        Path::new(&app_config.stt.model_path),
        &app_config.stt.model_url,
    )
    .await
    .map_err(|e| anyhow::anyhow!("STT model unavailable: {e}"))?;

    let stt = Arc::new(SttStreamer::new(Box::new(HttpSttRecognizer::new(
        app_config.stt.endpoint.clone(),
        app_config.stt.api_key.clone(),
    ))));

    let llm_client = Arc::new(HttpLlmClient::new(
        profile.llm_endpoint.clone(),
        profile.llm_api_key.clone(),
    ));

    let mut tools = callcore::llm::tools::ToolRegistry::new();
    tools.register(Arc::new(SendNotification {
        sms: None,
        notify_number: if app_config.sip.sms.notify_number.is_empty() {
            None
        } else {
            Some(app_config.sip.sms.notify_number.clone())
        },
    }));
    tools.register(Arc::new(TransferConversation {
        extension_map: app_config.sip.extension_to_did.clone(),
        transfer_sink: Arc::new(LoggingTransferSink),
    }));
    tools.register(Arc::new(EndConversation::new(Arc::new(LoggingHangupSink))));
    tools.register(Arc::new(ScheduleFollowup));

    let turn_engine = Arc::new(TurnEngine::new(
        llm_client,
        TurnEngineConfig {
            model: profile.model_id.clone(),
            temperature: Some(profile.temperature),
            max_tokens: Some(profile.max_tokens),
            instructions: profile.instructions.clone(),
            instructions_addendum: profile.instructions_addendum.clone(),
            tool_guidance_template: profile.tool_guidance_template.clone(),
            extensions: profile.extension_entries(),
        },
        tools,
    ));

    let tts_synth = Arc::new(HttpTtsSynthesizer::new(
        profile.tts_endpoint.clone(),
        profile.tts_api_key.clone(),
    ));
    let welcome_audio_pcmu = ensure_welcome_audio(&profile, tts_synth.as_ref())?;
    let tts = Arc::new(TtsStreamer::new(tts_synth));

    let sender = Arc::new(PacedSender::new(Arc::new(|_duration_rtp_units, _bytes: &[u8]| {
        // No RTP transport attached in standalone mode; a caller embedding
        // this crate supplies the real outbound sink here.
    })));

    let controller = ConversationController::new(vad, stt, turn_engine, tts, sender);
    controller
        .start_call(&profile.welcome_message_text, &welcome_audio_pcmu)
        .await;

    println!("callcore ready. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    controller.shutdown().await;

    Ok(())
}
