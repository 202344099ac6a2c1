use anyhow::{Context, Result};
use playlab::orchestrator::{Orchestrator, RunOutcome};
use playlab::services;
use playlab_core::{PlatformProfile, RuntimeEnvironment};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

const MIN_JAVA_MAJOR: u32 = 11;

const ASK_PROMPT: &str = "\
In a temporary directory, this tool will:
  * Download and run the QuestDB data engine.
  * Create a Python virtual environment with the notebook packages.
  * Launch a JupyterLab server with a prepared notebook.

The directory is deleted automatically when you exit.
";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let environment = RuntimeEnvironment::from_env();
    let profile = PlatformProfile::resolve(environment);

    // Nothing is downloaded or written before the user agrees. Container
    // runs are non-interactive and have implicitly agreed.
    if !environment.is_contained() {
        println!("{ASK_PROMPT}");
        if !confirm("Continue? [y/N] ")? {
            return Ok(ExitCode::FAILURE);
        }
    }

    if let Err(reason) = check_java(profile.exe_suffix).await {
        eprintln!("{reason:#}");
        return Ok(ExitCode::FAILURE);
    }

    let mut orchestrator = Orchestrator::new(profile)?;

    // Ctrl-C anywhere in the run cancels the token; the orchestrator turns
    // that into the same teardown as a normal stop.
    let interrupt = orchestrator.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match orchestrator.run().await {
        Ok(RunOutcome::Interrupted) => return Ok(ExitCode::SUCCESS),
        Ok(RunOutcome::Ready) => {}
        Err(e) => {
            error!("{e}");
            return Ok(ExitCode::FAILURE);
        }
    }

    orchestrator.print_endpoints();
    wait_for_stop(&orchestrator, environment).await;
    orchestrator.shutdown().await;
    println!("Stopped. The working area has been removed.");
    Ok(ExitCode::SUCCESS)
}

fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(answer.trim().to_ascii_lowercase().starts_with('y'))
}

async fn check_java(exe_suffix: &str) -> Result<()> {
    let java = services::find_java(exe_suffix)
        .context("no java executable under JAVA_HOME or on PATH; a JDK 11+ is required")?;
    let output = tokio::process::Command::new(&java)
        .arg("-version")
        .output()
        .await
        .with_context(|| format!("running {} -version", java.display()))?;
    // `java -version` reports on stderr.
    let text = String::from_utf8_lossy(&output.stderr);
    let major = services::parse_java_major(&text)
        .with_context(|| format!("could not parse java version from: {}", text.trim()))?;
    anyhow::ensure!(
        major >= MIN_JAVA_MAJOR,
        "Java {MIN_JAVA_MAJOR} or later is required, found major version {major}"
    );
    Ok(())
}

async fn wait_for_stop(orchestrator: &Orchestrator, environment: RuntimeEnvironment) {
    let token = orchestrator.shutdown_token();
    if environment.is_contained() {
        // No terminal attached; only a signal stops the run.
        token.cancelled().await;
        return;
    }

    use tokio::io::{AsyncBufReadExt, BufReader};
    println!("Press Enter (or Ctrl-C) to stop everything and clean up.");
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        _ = token.cancelled() => {}
        _ = stdin.read_line(&mut line) => {}
    }
}
