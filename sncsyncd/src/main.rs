use sncsyncd::daemon::{DaemonConfig, DaemonRuntime, run_self_test};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Test,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cli {
    mode: CliMode,
    config: Option<String>,
    setup: bool,
    resync: bool,
}

fn parse_cli<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = Cli {
        mode: CliMode::Run,
        config: None,
        setup: false,
        resync: false,
    };
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => cli.mode = CliMode::Help,
            "--test" => {
                if cli.mode != CliMode::Help {
                    cli.mode = CliMode::Test;
                }
            }
            "--setup" => cli.setup = true,
            "--resync" => cli.resync = true,
            "--config" => {
                let Some(path) = args.next() else {
                    anyhow::bail!("--config needs a path");
                };
                cli.config = Some(path);
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    cli.config = Some(path.to_string());
                } else {
                    anyhow::bail!("unknown argument: {other}");
                }
            }
        }
    }
    Ok(cli)
}

fn print_help() {
    println!("Usage: sncsyncd [--config <path>] [--setup] [--resync] [--test]");
    println!("  --help     Show this message");
    println!("  --config   Path to app.config.json (default: ./app.config.json or $SNC_CONFIG)");
    println!("  --setup    Create a folder for every mapped table under each root");
    println!("  --resync   Re-download every file to get the latest server version");
    println!("  --test     Run a download/upload/conflict check against JSUtil.js");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = parse_cli(std::env::args())?;
    if cli.mode == CliMode::Help {
        print_help();
        return Ok(());
    }

    let mut options = DaemonConfig::from_env(cli.config.as_deref())?;
    options.setup = cli.setup;
    options.resync = cli.resync;

    if cli.mode == CliMode::Test {
        return run_self_test(options).await;
    }
    let daemon = DaemonRuntime::bootstrap(options).await?;
    daemon.run().await
}
