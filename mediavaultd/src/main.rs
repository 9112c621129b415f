use mediavaultd::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run { skip_failed: bool },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut skip_failed = false;
    let mut help = false;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--skip-failed" => skip_failed = true,
            "--help" | "-h" => help = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    if help {
        return Ok(CliMode::Help);
    }
    Ok(CliMode::Run { skip_failed })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    mediavaultd::logging::init();
    let skip_failed = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: mediavaultd [--skip-failed]");
            println!("  --skip-failed   Do not retry files that failed in an earlier run");
            return Ok(());
        }
        CliMode::Run { skip_failed } => skip_failed,
    };
    let mut config = DaemonConfig::from_env()?;
    config.options.skip_failed |= skip_failed;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
