use emotesd::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Subreddits,
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
            "--subreddits" => mode = CliMode::Subreddits,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("EMOTES_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: emotesd [--once | --subreddits]");
        println!("  --once         Run a single sync pass, print its outcome and exit");
        println!("  --subreddits   Refresh and print the subreddit list, then exit");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    if mode == CliMode::Once {
        let outcome = daemon.run_pass().await;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    if mode == CliMode::Subreddits {
        for row in daemon.refresh_subreddits().await? {
            let state = if row.enabled { "enabled" } else { "disabled" };
            println!("{}\t{}\t{}", row.name, state, row.size_bytes);
        }
        return Ok(());
    }
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["emotesd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_once() {
        let mode = parse_cli_mode(vec!["emotesd".to_string(), "--once".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Once);
    }

    #[test]
    fn parse_cli_mode_supports_subreddits() {
        let mode =
            parse_cli_mode(vec!["emotesd".to_string(), "--subreddits".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Subreddits);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["emotesd".to_string(), "--help".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["emotesd".to_string(), "--logout".to_string()]).is_err());
    }
}
