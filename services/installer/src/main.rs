//! dnp-installer
//!
//! Resolves and installs DNP packages on this host.
//!
//! - **install**: resolve, download, configure and start a package batch
//! - **resolve**: print the install order without touching the host

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dnp_installer::config::Config;
use dnp_installer::fetcher::HttpContentStore;
use dnp_installer::install::FsFileWriter;
use dnp_installer::metadata::DirectoryReleaseProvider;
use dnp_installer::runtime::ComposeRuntime;
use dnp_installer::{
    ContentFetcher, InstallOptions, InstallRequest, Installer, PackageRequest, ProgressSink,
    Resolver, VersionSpec,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Install DNP packages and their dependencies.
#[derive(Debug, Parser)]
#[command(name = "dnp-installer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install a package and its dependencies.
    Install {
        /// Package name.
        name: String,

        /// Version, range, "latest" or content hash.
        #[arg(default_value = "latest")]
        version: String,

        /// Install only the named package.
        #[arg(long)]
        bypass_resolver: bool,

        /// Allow core packages pinned by content hash.
        #[arg(long)]
        bypass_core_restriction: bool,

        /// Compose setting as `package:KEY=VALUE`. Repeatable.
        #[arg(long = "setting", value_parser = parse_setting)]
        settings: Vec<Setting>,
    },

    /// Print the install order as JSON.
    Resolve {
        /// Package name.
        name: String,

        /// Version, range, "latest" or content hash.
        #[arg(default_value = "latest")]
        version: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Setting {
    package: String,
    key: String,
    value: String,
}

fn parse_setting(raw: &str) -> Result<Setting, String> {
    let (package, assignment) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected package:KEY=VALUE, got {raw:?}"))?;
    let (key, value) = assignment
        .split_once('=')
        .ok_or_else(|| format!("expected package:KEY=VALUE, got {raw:?}"))?;
    if package.is_empty() || key.is_empty() {
        return Err(format!("expected package:KEY=VALUE, got {raw:?}"));
    }
    Ok(Setting {
        package: package.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!(
        root_dir = %config.root_dir.display(),
        releases_dir = %config.releases_dir.display(),
        content_url = %config.content_url,
        "Configuration loaded"
    );

    let provider = DirectoryReleaseProvider::load(&config.releases_dir)
        .with_context(|| format!("loading releases from {}", config.releases_dir.display()))?;
    let resolver = Resolver::new(Arc::new(provider));

    match cli.command {
        Commands::Resolve { name, version } => {
            let request = PackageRequest::parse(name, &version)?;
            let resolution = resolver.resolve(&request).await?;
            let order: Vec<serde_json::Value> = resolution
                .order
                .iter()
                .map(|node| {
                    serde_json::json!({
                        "name": node.name,
                        "version": node.version.to_string(),
                        "dependencies": node.dependencies.keys().collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&order)?);
        }

        Commands::Install {
            name,
            version,
            bypass_resolver,
            bypass_core_restriction,
            settings,
        } => {
            let version: VersionSpec = version.parse()?;
            let mut request = InstallRequest::new(name, version).with_options(InstallOptions {
                bypass_resolver,
                bypass_core_restriction,
            });
            for setting in settings {
                request = request.with_setting(setting.package, setting.key, setting.value);
            }

            let store = HttpContentStore::new(&config.content_url, CONNECT_TIMEOUT)?;
            let fetcher = ContentFetcher::new(Arc::new(store), config.fetcher_config());
            let installer = Installer::new(
                resolver,
                fetcher,
                Arc::new(FsFileWriter),
                Arc::new(ComposeRuntime::default()),
                config.install_paths(),
            );

            let (progress, mut events) = ProgressSink::channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let at = event.at.to_rfc3339();
                    eprintln!("[{at}] {}: {}", event.package, event.message);
                }
            });

            let result = installer.install(&request, &progress).await;
            drop(progress);
            let _ = printer.await;

            let report = result?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setting() {
        let setting = parse_setting("geth.dnp.dappnode.eth:SYNCMODE=snap").unwrap();
        assert_eq!(setting.package, "geth.dnp.dappnode.eth");
        assert_eq!(setting.key, "SYNCMODE");
        assert_eq!(setting.value, "snap");
    }

    #[test]
    fn test_parse_setting_keeps_equals_in_value() {
        let setting = parse_setting("a:ARGS=--x=1").unwrap();
        assert_eq!(setting.value, "--x=1");
    }

    #[test]
    fn test_parse_setting_rejects_malformed() {
        assert!(parse_setting("no-colon").is_err());
        assert!(parse_setting("pkg:NOEQUALS").is_err());
        assert!(parse_setting(":KEY=v").is_err());
    }

    #[test]
    fn test_cli_parses_install() {
        let cli = Cli::try_parse_from([
            "dnp-installer",
            "install",
            "a.dnp.dappnode.eth",
            "^1.0",
            "--bypass-resolver",
            "--setting",
            "a.dnp.dappnode.eth:PORT=80",
        ])
        .unwrap();
        match cli.command {
            Commands::Install {
                version,
                bypass_resolver,
                settings,
                ..
            } => {
                assert_eq!(version, "^1.0");
                assert!(bypass_resolver);
                assert_eq!(settings.len(), 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
