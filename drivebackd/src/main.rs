use drivebackd::daemon::{DaemonConfig, DaemonRuntime};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "drivebackd=info,driveback_core=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    ListFailed,
    RetryFailed,
    ListPolicies,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--list-failed" => mode = CliMode::ListFailed,
            "--retry-failed" => mode = CliMode::RetryFailed,
            "--list-policies" => mode = CliMode::ListPolicies,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: drivebackd [--once | --list-failed | --retry-failed | --list-policies]");
        println!("  --once            Run a single sync pass and print its summary");
        println!("  --list-failed     Print failed transfers as JSON");
        println!("  --retry-failed    Mark every failed transfer pending for the next pass");
        println!("  --list-policies   Print folder policies as JSON");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    let control = daemon.control();
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::Once => {
            let report = control.run_once().await?;
            print_json(&report)
        }
        CliMode::ListFailed => print_json(&control.list_failed().await?),
        CliMode::RetryFailed => {
            let count = control.mark_all_failed_pending().await?;
            info!(count, "failed transfers marked pending");
            println!("{count} transfer(s) marked pending");
            Ok(())
        }
        CliMode::ListPolicies => print_json(&control.list_policies().await?),
        CliMode::Help => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        std::iter::once("drivebackd")
            .chain(extra.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_maintenance_modes() {
        assert_eq!(parse_cli_mode(args(&["--once"])).unwrap(), CliMode::Once);
        assert_eq!(
            parse_cli_mode(args(&["--list-failed"])).unwrap(),
            CliMode::ListFailed
        );
        assert_eq!(
            parse_cli_mode(args(&["--retry-failed"])).unwrap(),
            CliMode::RetryFailed
        );
        assert_eq!(
            parse_cli_mode(args(&["--list-policies"])).unwrap(),
            CliMode::ListPolicies
        );
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_arguments() {
        let err = parse_cli_mode(args(&["--bogus"])).unwrap_err();
        assert!(err.to_string().contains("--bogus"));
    }
}
