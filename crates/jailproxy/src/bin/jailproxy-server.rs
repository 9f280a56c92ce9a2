use std::process;

use jailproxy::VersionInfo;

const USAGE: &str = "Usage: jailproxy-server [--version] [--help]";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match parse_args(&args) {
        Ok(Command::Serve) => {}
        Ok(Command::Version) => {
            println!("{}", VersionInfo::new());
            return;
        }
        Ok(Command::Help) => {
            print_help();
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    }

    jailproxy::logging::init_tracing();

    if let Err(e) = run() {
        tracing::error!("Proxy server failed: {e:#}");
        process::exit(1);
    }
}

enum Command {
    Serve,
    Version,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut command = Command::Serve;
    for arg in args.iter().skip(1) {
        command = match arg.as_str() {
            "--version" | "-V" => Command::Version,
            "--help" | "-h" => Command::Help,
            other => return Err(format!("unexpected argument: {other}")),
        };
    }
    Ok(command)
}

fn print_help() {
    println!("{USAGE}");
    println!();
    println!("Reads one request line per call from stdin, runs it, and writes one");
    println!("response line to stdout. Exits when stdin is closed.");
    println!();
    println!("Environment:");
    println!("  JAILPROXY_LOG_PROXY        Append raw traffic to the diagnostic log (1/true)");
    println!("  JAILPROXY_PROXY_LOG        Diagnostic log path [default: /tmp/proxy.log]");
    println!("  JAILPROXY_MAX_FRAME_BYTES  Maximum line length in bytes");
    println!("  JAILPROXY_LOG              Log level for stderr [default: info]");
}

#[cfg(unix)]
fn run() -> anyhow::Result<()> {
    use anyhow::Context;
    use jailproxy::{ServerConfig, SubprocessExecutor, run_server};

    let config = ServerConfig::from_env();
    tracing::debug!(version = %VersionInfo::new(), "Starting proxy server");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run_server(&SubprocessExecutor::new(), config))?;
    Ok(())
}

#[cfg(not(unix))]
fn run() -> anyhow::Result<()> {
    anyhow::bail!("jailproxy-server requires a unix platform")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("jailproxy-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_flags() {
        assert!(matches!(parse_args(&args(&[])), Ok(Command::Serve)));
        assert!(matches!(parse_args(&args(&["-V"])), Ok(Command::Version)));
        assert!(matches!(parse_args(&args(&["--help"])), Ok(Command::Help)));
        assert_eq!(
            parse_args(&args(&["--port", "3"])).err().as_deref(),
            Some("unexpected argument: --port")
        );
    }
}
