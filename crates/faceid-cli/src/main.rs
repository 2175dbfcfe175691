use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::locator::primary_candidate;
use faceid_core::{decode_image, FaceLocator, FeatureEncoder, FusedMatcher, LivenessGate, Matcher};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[zbus::proxy(
    interface = "org.faceid.Engine1",
    default_service = "org.faceid.Engine1",
    default_path = "/org/faceid/Engine1"
)]
trait Engine {
    async fn enroll(&self, identity: &str, image: &[u8]) -> zbus::Result<(bool, String)>;
    async fn authenticate(&self, image: &[u8]) -> zbus::Result<String>;
    async fn verify(&self, identity: &str, image: &[u8]) -> zbus::Result<String>;
    async fn has_enrollment(&self, identity: &str) -> zbus::Result<bool>;
    async fn remove_enrollment(&self, identity: &str) -> zbus::Result<bool>;
    async fn reload(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "faceid", about = "faceid biometric authentication CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in an image under an identity
    Enroll { identity: String, image: PathBuf },
    /// Identify the face in an image against all enrollments
    Authenticate { image: PathBuf },
    /// Check the face in an image against one identity
    Verify { identity: String, image: PathBuf },
    /// Report whether an identity is enrolled
    Check { identity: String },
    /// Remove an enrollment
    Remove { identity: String },
    /// Make the daemon reread its enrollment store
    Reload,
    /// Show daemon status
    Status,
    /// Run detection, liveness and encoding on an image locally
    Inspect { image: PathBuf },
    /// Score two images against each other locally
    Compare { first: PathBuf, second: PathBuf },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let ok = match cli.command {
        Commands::Inspect { image } => return inspect(&image),
        Commands::Compare { first, second } => return compare(&first, &second),
        Commands::Enroll { identity, image } => {
            let proxy = connect(cli.session).await?;
            let (ok, message) = proxy.enroll(&identity, &read_image(&image)?).await?;
            println!("{message}");
            ok
        }
        Commands::Authenticate { image } => {
            let proxy = connect(cli.session).await?;
            print_outcome(&proxy.authenticate(&read_image(&image)?).await?)?
        }
        Commands::Verify { identity, image } => {
            let proxy = connect(cli.session).await?;
            print_outcome(&proxy.verify(&identity, &read_image(&image)?).await?)?
        }
        Commands::Check { identity } => {
            let enrolled = connect(cli.session).await?.has_enrollment(&identity).await?;
            println!("{identity}: {}", if enrolled { "enrolled" } else { "not enrolled" });
            enrolled
        }
        Commands::Remove { identity } => {
            let removed = connect(cli.session).await?.remove_enrollment(&identity).await?;
            println!("{identity}: {}", if removed { "removed" } else { "not enrolled" });
            removed
        }
        Commands::Reload => {
            connect(cli.session).await?.reload().await?;
            println!("enrollment cache dropped");
            true
        }
        Commands::Status => {
            let raw = connect(cli.session).await?.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn connect(session: bool) -> Result<EngineProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    EngineProxy::new(&conn)
        .await
        .context("faceidd is not reachable on the bus")
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print an authenticate/verify reply; true when it authenticated.
fn print_outcome(raw: &str) -> Result<bool> {
    let outcome: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome["status"] == "authenticated")
}

fn inspect(path: &Path) -> Result<ExitCode> {
    let grid = decode_image(&read_image(path)?)?;
    println!("image: {}x{}", grid.width(), grid.height());

    let faces = FaceLocator::default().locate(&grid);
    println!("faces: {}", faces.len());
    for face in &faces {
        println!(
            "  x={} y={} {}x{} neighbors={}",
            face.x, face.y, face.width, face.height, face.neighbors
        );
    }
    let Some(face) = primary_candidate(&faces) else {
        return Ok(ExitCode::FAILURE);
    };

    let verdict = LivenessGate::default().check(&grid, face);
    println!("liveness: {}", serde_json::to_string_pretty(&verdict)?);

    let encoding = FeatureEncoder::new().encode(&grid, face)?;
    let blocks = [
        ("intensity", encoding.intensity()),
        ("texture", encoding.texture()),
        ("shape", encoding.shape()),
        ("gradient", encoding.gradient()),
    ];
    for (name, values) in blocks {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        println!("  {name:<9} len={:<3} mean={mean:.5}", values.len());
    }

    Ok(if verdict.passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn compare(first: &Path, second: &Path) -> Result<ExitCode> {
    let locator = FaceLocator::default();
    let encoder = FeatureEncoder::new();
    let mut encodings = Vec::with_capacity(2);
    for path in [first, second] {
        let grid = decode_image(&read_image(path)?)?;
        let faces = locator.locate(&grid);
        let face = primary_candidate(&faces)
            .with_context(|| format!("no face found in {}", path.display()))?;
        encodings.push(encoder.encode(&grid, face)?);
    }

    let matcher = FusedMatcher::default();
    let threshold = faceid_core::matcher::MatchConfig::default().threshold;
    let cmp = matcher.compare(&encodings[0], &encodings[1], threshold);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "score": cmp.score,
            "threshold": threshold,
            "match": cmp.is_match,
            "naturalness_rejected": cmp.naturalness_rejected,
            "breakdown": cmp.breakdown,
        }))?
    );
    Ok(if cmp.is_match { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
