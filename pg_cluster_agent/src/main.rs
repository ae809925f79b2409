use anyhow::Context;
use clap::{Parser, Subcommand};
use pg_cluster_core::config::{AgentConfig, NodeEnvironment, Settings, SETTINGS_ENV};
use pg_cluster_core::database::{FileOwner, PgCtlCluster, PostgresAdmin};
use pg_cluster_core::election::reconcile::{Collaborators, Reconciler};
use pg_cluster_core::endpoints::KubeServiceStore;
use pg_cluster_core::log::{init_logging, log_startup};
use pg_cluster_core::materialize::Materializer;
use pg_cluster_core::replication::RepmgrCli;
use pg_cluster_core::shutdown::run_repmgrd;
use pg_cluster_core::topology::KubeLabelStore;
use pg_cluster_core::watchdog::LogWatchdog;
use std::path::PathBuf;
use std::sync::Arc;

/// PostgreSQL high-availability agent
#[derive(Parser, Debug)]
#[command(name = "pg-cluster-agent", version, about)]
struct Cli {
    /// Settings file (TOML or YAML)
    #[arg(long, global = true, env = SETTINGS_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the local node, then run repmgrd in the foreground
    Entrypoint,
    /// repmgrd promote callback
    Promote,
    /// repmgrd follow callback
    Follow {
        /// repmgr node id of the new upstream
        node_id: u32,
    },
    /// Log the cluster as repmgr sees it
    Show,
    /// Print the effective settings and rendered configuration files
    RenderConfig,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Entrypoint => "entrypoint",
            Self::Promote => "promote",
            Self::Follow { .. } => "follow",
            Self::Show => "show",
            Self::RenderConfig => "render-config",
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AgentConfig> {
    let env = NodeEnvironment::from_env().context("reading node identity from the environment")?;
    let settings = match path {
        Some(path) => Settings::from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    Ok(AgentConfig::new(env, settings)?)
}

async fn production_reconciler(config: &AgentConfig) -> anyhow::Result<Reconciler> {
    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API")?;
    let namespace = &config.env.namespace;
    let settings = &config.settings;
    let owner = FileOwner::lookup(&settings.database.os_user)
        .with_context(|| format!("resolving the {} account", settings.database.os_user))?;

    let collaborators = Collaborators {
        labels: Arc::new(KubeLabelStore::new(client.clone(), namespace)),
        services: Arc::new(KubeServiceStore::new(client, namespace)),
        replication: Arc::new(RepmgrCli::new(
            config.identity().name.clone(),
            settings.paths.repmgr_conf.clone(),
            settings.database.os_user.clone(),
            config.replication_login(),
        )),
        database: Arc::new(PgCtlCluster::new(config, owner)),
        admin: Arc::new(PostgresAdmin::new(
            settings.paths.socket_dir.clone(),
            settings.database.port,
            &settings.database.os_user,
            &settings.database.replication_user,
            &settings.database.replication_database,
            config.sql_retry(),
        )),
        owner,
    };
    Ok(Reconciler::new(config, collaborators))
}

async fn entrypoint(config: &AgentConfig) -> anyhow::Result<i32> {
    let reconciler = production_reconciler(config).await?;
    reconciler.announce().await?;

    let watchdog = LogWatchdog::spawn(config.settings.paths.repmgr_log.clone())
        .context("starting the repmgr log watchdog")?;

    let state = reconciler.reconcile().await?;
    tracing::info!("Node reconciled as {}", state);

    let exit = run_repmgrd(
        &config.settings.paths.repmgr_conf,
        &config.settings.database.os_user,
    )
    .await?;
    watchdog.stop();
    Ok(exit.exit_code())
}

fn render_config(config: &AgentConfig) -> anyhow::Result<()> {
    let materializer = Materializer::new(config);
    println!("# settings");
    println!("{}", config.settings.to_toml()?);
    println!("# {}", materializer.repmgr_conf.display());
    println!("{}", materializer.render_repmgr_conf());
    println!("# {}", materializer.override_path().display());
    println!("{}", materializer.render_postgresql_override());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    init_logging(&config.settings.logging);
    log_startup(
        env!("CARGO_PKG_VERSION"),
        &config.identity().name,
        cli.command.name(),
    );

    match cli.command {
        Command::Entrypoint => {
            let code = entrypoint(&config).await?;
            std::process::exit(code);
        }
        Command::Promote => {
            let reconciler = production_reconciler(&config).await?;
            reconciler.on_promote().await?;
        }
        Command::Follow { node_id } => {
            let reconciler = production_reconciler(&config).await?;
            reconciler.on_follow(node_id).await?;
        }
        Command::Show => {
            let reconciler = production_reconciler(&config).await?;
            reconciler.replication().cluster_show().await?;
        }
        Command::RenderConfig => render_config(&config)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_callbacks() {
        let cli = Cli::try_parse_from(["pg-cluster-agent", "follow", "3"]).unwrap();
        assert!(matches!(cli.command, Command::Follow { node_id: 3 }));

        let cli = Cli::try_parse_from(["pg-cluster-agent", "promote"]).unwrap();
        assert_eq!(cli.command.name(), "promote");
    }

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::try_parse_from([
            "pg-cluster-agent",
            "render-config",
            "--config",
            "/etc/pg-cluster.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/pg-cluster.toml")));
        assert!(matches!(cli.command, Command::RenderConfig));
    }

    #[test]
    fn test_follow_requires_node_id() {
        assert!(Cli::try_parse_from(["pg-cluster-agent", "follow"]).is_err());
        assert!(Cli::try_parse_from(["pg-cluster-agent", "follow", "x"]).is_err());
    }
}
