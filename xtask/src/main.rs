use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use opswatch_core::{
    telemetry, Credential, CredentialStore, FileKeyValueStore, StreamHandle,
};
use std::convert::Infallible;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for OpsWatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an offline smoke test of credential persistence and stream decoding.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let backend = Arc::new(FileKeyValueStore::new(temp_dir.path().to_path_buf()));
    let credential = Credential::expiring_in("smoke-token", Some("smoke-refresh".into()), Utc::now(), 3600);
    CredentialStore::new(backend.clone()).set(credential.clone())?;
    let restored = CredentialStore::new(backend).load()?;
    if restored.as_ref() != Some(&credential) {
        bail!("credential did not survive a reload: {restored:?}");
    }
    info!("credential round trip ok");

    let runtime = Runtime::new()?;
    let content = runtime.block_on(async {
        let chunks = [
            "data: {\"content\":\"smo",
            "ke \",\"done\":false}\n\ndata: {\"content\":\"ok\",\"done\":false}\n",
            "\ndata: {\"content\":\"\",\"done\":true}\n\n",
        ];
        let body = futures::stream::iter(chunks.map(|chunk| Ok::<_, Infallible>(chunk.as_bytes())));
        StreamHandle::from_byte_stream(body).collect_content().await
    })?;
    if content != "smoke ok" {
        bail!("unexpected stream content `{content}`");
    }
    info!(content = %content, "stream decoding ok");

    Ok(())
}
