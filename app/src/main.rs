use clap::Parser;
use opswatch::{build_session, load_settings, run, Cli};
use opswatch_core::telemetry;
use tokio::runtime::Runtime;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(telemetry::default_filter())?;

    let cli = Cli::parse();
    let settings = load_settings(cli.base_url.as_deref())?;

    let runtime = Runtime::new()?;
    runtime.block_on(async {
        let session = build_session(&settings)?;
        run(cli, session).await
    })
}
