use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use opswatch_core::{
    AnalysisApi, AnalysisRequest, AnomalyQuery, ApiError, CapacityQuery, KnowledgeQuery, Session,
    StreamHandle, StreamUpdate,
};
use std::io::Write;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "opswatch", version, about = "OpsWatch monitoring client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Overrides the API base URL from opswatch.yaml.
    #[arg(long, global = true)]
    pub base_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in and store the credential.
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "OPSWATCH_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored credential.
    Logout,
    /// Show the signed-in user.
    Whoami,
    /// Stream an AI analysis to stdout.
    Analyze {
        #[arg(value_enum)]
        feature: Feature,
        /// Host id, report id or search text, depending on the feature.
        target: String,
        #[command(flatten)]
        options: AnalyzeOptions,
    },
    /// Run anomaly detection and print the result as JSON.
    Detect {
        host_id: String,
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long)]
        metric: Option<String>,
    },
}

/// Optional knobs for `analyze`; each feature reads the ones it understands.
#[derive(Args, Debug, Clone, Default)]
pub struct AnalyzeOptions {
    #[arg(long)]
    pub hours: Option<u32>,
    /// Metric or resource type (`cpu`, `memory`, `disk`).
    #[arg(long)]
    pub metric: Option<String>,
    #[arg(long)]
    pub category: Option<String>,
    /// Capacity forecast horizon in days.
    #[arg(long)]
    pub days: Option<u32>,
    /// Capacity alert threshold in percent.
    #[arg(long)]
    pub threshold: Option<u32>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    Anomaly,
    Performance,
    Inspection,
    Knowledge,
    Cost,
    Capacity,
}

impl Feature {
    pub fn request(self, target: &str, options: AnalyzeOptions) -> Result<AnalysisRequest> {
        let AnalyzeOptions {
            hours,
            metric,
            category,
            days,
            threshold,
        } = options;
        Ok(match self {
            Self::Anomaly => AnalysisRequest::Anomaly(AnomalyQuery {
                host_id: target.to_string(),
                metric_type: metric,
                hours,
            }),
            Self::Performance => AnalysisRequest::Performance {
                host_id: target.to_string(),
                hours,
            },
            Self::Inspection => AnalysisRequest::InspectionReport {
                report_id: target
                    .parse()
                    .map_err(|_| anyhow!("inspection report id must be a number, got `{target}`"))?,
            },
            Self::Knowledge => AnalysisRequest::KnowledgeSearch(KnowledgeQuery {
                q: target.to_string(),
                category,
            }),
            Self::Cost => AnalysisRequest::CostOptimization {
                host_id: target.to_string(),
            },
            Self::Capacity => AnalysisRequest::Capacity(CapacityQuery {
                host_id: target.to_string(),
                resource_type: metric,
                days,
                threshold,
            }),
        })
    }
}

pub async fn run(cli: Cli, session: Session) -> Result<()> {
    match cli.command {
        Command::Login { username, password } => {
            let user = session.login(&username, &password).await.map_err(user_error)?;
            println!("Signed in as {} ({})", user.username, user.role);
        }
        Command::Logout => {
            session.client().credentials().load()?;
            session.logout();
            println!("Signed out");
        }
        Command::Whoami => {
            let user = require_session(&session).await?;
            println!("{} <{}> role={} status={}", user.username, user.email, user.role, user.status);
        }
        Command::Analyze {
            feature,
            target,
            options,
        } => {
            require_session(&session).await?;
            let request = feature.request(&target, options)?;
            let handle = AnalysisApi::new(session.client().clone()).stream(&request);
            print_stream(handle).await?;
        }
        Command::Detect {
            host_id,
            hours,
            metric,
        } => {
            require_session(&session).await?;
            let query = AnomalyQuery {
                host_id,
                metric_type: metric,
                hours,
            };
            let result = AnalysisApi::new(session.client().clone())
                .detect_anomalies(&query)
                .await
                .map_err(user_error)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

async fn require_session(session: &Session) -> Result<opswatch_core::UserInfo> {
    match session.restore().await.map_err(user_error)? {
        Some(user) => Ok(user),
        None => bail!("Not signed in. Run `opswatch login` first."),
    }
}

/// Prints content as it arrives; Ctrl-C cancels the stream.
async fn print_stream(mut handle: StreamHandle) -> Result<()> {
    let cancel = handle.cancel_handle();
    let mut stdout = std::io::stdout();
    loop {
        let update = tokio::select! {
            update = handle.recv() => update,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                info!("analysis cancelled");
                None
            }
        };
        match update {
            Some(StreamUpdate::Event(event)) => {
                write!(stdout, "{}", event.content)?;
                stdout.flush()?;
            }
            Some(StreamUpdate::Completed) | None => break,
            Some(StreamUpdate::Failed(err)) => {
                writeln!(stdout)?;
                return Err(user_error(err));
            }
        }
    }
    writeln!(stdout)?;
    Ok(())
}

fn user_error(err: ApiError) -> anyhow::Error {
    anyhow!(err.user_message())
}
