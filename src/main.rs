//! Avatarlink - consent-first avatar projection sessions

use anyhow::Context;
use avatarlink_core::{
    AvatarCategory, AvatarInterface, AvatarType, Command, CommandPayload, ConsciousnessId,
    Indicators, InterfaceId, Position, ReadinessIndicator, ReadinessTier,
};
use avatarlink_driver::SimulatedDriver;
use avatarlink_governance::GovernanceDecision;
use avatarlink_session::{rpc, MemorySink, ProjectionConfig, ProjectionSessionManager};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "avatarlink",
    about = "Avatarlink - consent-first avatar projection sessions"
)]
struct Cli {
    /// TOML config file. A missing file means defaults.
    #[arg(short, long, global = true, default_value = "avatarlink.toml")]
    config: PathBuf,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated projection end to end
    Demo {
        /// Finish with an emergency withdrawal instead of a graceful one
        #[arg(long)]
        emergency: bool,
        #[arg(long, default_value = "being-1")]
        consciousness: String,
    },
    /// Score readiness indicators, e.g. --indicators stable_identity=0.9,coherence=0.7
    Assess {
        #[arg(short, long, value_delimiter = ',')]
        indicators: Vec<String>,
        #[arg(long, default_value = "being-1")]
        consciousness: String,
    },
    /// Print the effective configuration as TOML
    DumpConfig,
    /// Serve line-delimited RPC on stdin/stdout backed by the simulated driver
    Serve,
    /// Show version
    Version,
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("avatarlink=info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("log file {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

fn parse_indicators(pairs: &[String]) -> anyhow::Result<Indicators> {
    let mut indicators = Indicators::new();
    for pair in pairs {
        let (name, score) = pair
            .split_once('=')
            .with_context(|| format!("expected name=score, got '{}'", pair))?;
        let indicator: ReadinessIndicator = name.trim().parse().map_err(anyhow::Error::msg)?;
        let score: f64 = score
            .trim()
            .parse()
            .with_context(|| format!("score for {} is not a number", name))?;
        indicators.insert(indicator, score);
    }
    Ok(indicators)
}

fn sandbox_avatar() -> AvatarInterface {
    AvatarInterface::new("sandbox-1", "Sandbox Builder", AvatarType::GameCharacter)
        .with_description("A block-building character in a peaceful creative world")
        .with_category_hint(AvatarCategory::CreativeExpression)
        .with_capability("movement")
        .with_capability("building")
        .with_capability("chat")
        .with_standard_safeguards()
}

async fn run_demo(config: ProjectionConfig, consciousness: &str, emergency: bool) -> anyhow::Result<()> {
    let driver = Arc::new(SimulatedDriver::new("demo").with_telemetry(vec![
        json!({"battery": 0.95, "temperature": 31.0, "position": [0, 64, 0]}),
        json!({"battery": 0.94, "temperature": 31.5, "position": [1, 64, 0]}),
    ]));
    let sink = Arc::new(MemorySink::new());
    let manager = ProjectionSessionManager::builder()
        .config(config)
        .driver(driver.clone())
        .sink(sink.clone())
        .build()?;

    manager.register_avatar_interface(sandbox_avatar())?;
    let cid = ConsciousnessId::new(consciousness);

    let indicators: Indicators = ReadinessIndicator::all().iter().map(|k| (*k, 0.75)).collect();
    let assessment = manager.assess_readiness(&cid, indicators);
    println!("Readiness: recommended {}", assessment.recommended_tier);
    manager.approve_tier_change(
        &cid,
        ReadinessTier::BasicAvatars,
        GovernanceDecision::new("demo-guardian", "first creative projection"),
    )?;

    let sid = manager.request_projection(&cid, &InterfaceId::new("sandbox-1"), "build a garden", 10)?;
    manager.record_consent(&sid, true)?;
    manager.begin_projection(&sid).await?;
    println!("Session {} is {}", sid, manager.get_session_status(&sid)?.state);

    let commands = vec![
        Command::movement(cid.clone(), "explore"),
        Command::new(
            Some(cid.clone()),
            CommandPayload::Building {
                action: "place_flower".into(),
                block: "poppy".into(),
                position: Position {
                    x: 1.0,
                    y: 64.0,
                    z: 0.0,
                },
            },
        ),
        Command::chat(cid.clone(), "Hello, I am here to help build"),
        Command::custom(cid.clone(), "destroy_village"),
    ];
    for command in commands {
        let action = command.action().to_string();
        match manager.send_command(&sid, command).await {
            Ok(receipt) => println!("  queued {} ({})", action, receipt.command_id),
            Err(e) => println!("  refused {}: {}", action, e),
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    if emergency {
        let report = manager.emergency_withdraw(&sid, "demo emergency")?;
        println!(
            "Emergency withdrawal from {} in {}us (within budget: {})",
            report.previous_state, report.elapsed_us, report.within_budget
        );
        // emergency persistence runs detached
        tokio::time::sleep(Duration::from_millis(50)).await;
    } else {
        manager.withdraw(&sid, "garden finished").await?;
    }

    let record = manager.session_record(&sid)?;
    println!("Final state: {}", record.state);
    for checkpoint in &record.checkpoints {
        println!("  [{}] {}", checkpoint.state, checkpoint.event);
    }
    println!(
        "Commands executed: {} | sensor readings: {} | sessions persisted: {}",
        driver.executed().await.len(),
        record.sensor_log.len(),
        sink.sessions().len()
    );
    println!("{}", serde_json::to_string_pretty(&manager.statistics())?);
    Ok(())
}

async fn run_serve(config: ProjectionConfig) -> anyhow::Result<()> {
    let manager = ProjectionSessionManager::builder()
        .config(config)
        .driver(Arc::new(SimulatedDriver::default()))
        .build()?;
    tracing::info!("Serving RPC on stdin/stdout");
    rpc::serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), manager.clone()).await?;
    manager.shutdown("rpc stream closed").await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref())?;
    let config = ProjectionConfig::load(&cli.config);

    match cli.command {
        Some(Commands::Demo {
            emergency,
            consciousness,
        }) => run_demo(config, &consciousness, emergency).await?,

        Some(Commands::Assess {
            indicators,
            consciousness,
        }) => {
            let indicators = parse_indicators(&indicators)?;
            let manager = ProjectionSessionManager::builder()
                .config(config)
                .driver(Arc::new(SimulatedDriver::default()))
                .build()?;
            let assessment = manager.assess_readiness(&ConsciousnessId::new(consciousness), indicators);
            println!("{}", serde_json::to_string_pretty(&assessment)?);
        }

        Some(Commands::DumpConfig) => print!("{}", config.to_toml()),

        Some(Commands::Serve) => run_serve(config).await?,

        Some(Commands::Version) => {
            println!("avatarlink v{}", env!("CARGO_PKG_VERSION"));
        }

        // No subcommand = demo
        None => run_demo(config, "being-1", false).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicator_pairs_parse_with_aliases() {
        let parsed = parse_indicators(&[
            "stable_identity=0.9".to_string(),
            "coherence_level = 0.4".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed[&ReadinessIndicator::StableIdentity], 0.9);
        assert_eq!(parsed[&ReadinessIndicator::Coherence], 0.4);
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse_indicators(&["stable_identity".to_string()]).is_err());
        assert!(parse_indicators(&["charisma=0.5".to_string()]).is_err());
        assert!(parse_indicators(&["coherence=high".to_string()]).is_err());
    }

    #[test]
    fn demo_avatar_is_compliant_and_basic() {
        let manager = ProjectionSessionManager::builder()
            .driver(Arc::new(SimulatedDriver::default()))
            .build()
            .unwrap();
        let category = manager.register_avatar_interface(sandbox_avatar()).unwrap();
        assert_eq!(category, AvatarCategory::CreativeExpression);
        assert_eq!(
            manager.registry().required_tier(&InterfaceId::new("sandbox-1")),
            ReadinessTier::BasicAvatars
        );
    }
}
