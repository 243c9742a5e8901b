use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use projmirror_core::ProjectClient;
use projmirrord::config::DaemonConfig;
use projmirrord::daemon::{AppContext, SyncService};
use projmirrord::presenter::Presenter;
use projmirrord::storage::{CredentialStorage, Settings, SqliteStore};
use projmirrord::sync::tree::SyncItem;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    List,
    Projects,
    Login,
    Logout,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    mode: CliMode,
    project: Option<String>,
    organization: Option<String>,
    paths: Vec<PathBuf>,
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs {
        mode: CliMode::Run,
        project: None,
        organization: None,
        paths: Vec::new(),
    };
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "run" => parsed.mode = CliMode::Run,
            "--project" => {
                parsed.project = Some(args.next().context("--project requires an id")?);
            }
            "--org" => {
                parsed.organization = Some(args.next().context("--org requires an id")?);
            }
            "--list" => parsed.mode = CliMode::List,
            "--projects" => parsed.mode = CliMode::Projects,
            "--login" => parsed.mode = CliMode::Login,
            "--logout" => parsed.mode = CliMode::Logout,
            "--help" | "-h" => parsed.mode = CliMode::Help,
            other if other.starts_with('-') => anyhow::bail!("unknown argument: {other}"),
            path => parsed.paths.push(PathBuf::from(path)),
        }
    }
    if !parsed.paths.is_empty() && parsed.mode != CliMode::Run {
        anyhow::bail!("paths are only accepted by run");
    }
    Ok(parsed)
}

fn print_usage() {
    println!("Usage: projmirrord [run] [--project ID] [--org ID] [PATH...]");
    println!("       projmirrord --list | --projects | --login | --logout | --help");
    println!("  run          Track PATHs (if given), sync them and watch until Ctrl-C");
    println!("  --project    Switch the current project first");
    println!("  --org        Remember the organization id");
    println!("  --list       Print the tracked items of the current project");
    println!("  --projects   List the organization's projects");
    println!("  --login      Read a session key from stdin and save it");
    println!("  --logout     Remove the saved session key");
}

fn print_items(items: &[SyncItem]) {
    let mut stack: Vec<(&SyncItem, usize)> = items.iter().rev().map(|item| (item, 0)).collect();
    while let Some((item, depth)) = stack.pop() {
        let marker = if item.ignored {
            format!("  [ignored: {:?}]", item.ignore_reason)
        } else {
            String::new()
        };
        let suffix = if item.is_directory { "/" } else { "" };
        println!("{:indent$}{}{suffix}{marker}", "", item.name, indent = depth * 2);
        stack.extend(item.children.iter().rev().map(|child| (child, depth + 1)));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = parse_cli_args(std::env::args())?;
    if args.mode == CliMode::Help {
        print_usage();
        return Ok(());
    }
    projmirrord::logging::init()?;

    let config = DaemonConfig::from_env()?;
    let credentials = CredentialStorage::new(config.session_key.clone())
        .context("failed to open credential storage")?;
    match args.mode {
        CliMode::Logout => {
            credentials.delete_session_key()?;
            eprintln!("[projmirrord] saved session key removed");
            return Ok(());
        }
        CliMode::Login => {
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read session key from stdin")?;
            let key = line.trim();
            anyhow::ensure!(!key.is_empty(), "empty session key");
            credentials.save_session_key(key)?;
            eprintln!("[projmirrord] session key saved");
            return Ok(());
        }
        _ => {}
    }

    let store = SqliteStore::open_in(&config.data_dir)
        .await
        .with_context(|| format!("failed to open state store in {:?}", config.data_dir))?;
    let settings = Settings::new(store.clone());
    if let Some(organization) = &args.organization {
        settings.set_organization_id(organization).await?;
    }
    let organization_id = match config.organization_id.clone() {
        Some(id) => id,
        None => settings
            .organization_id()
            .await?
            .context("no organization id; set PROJMIRROR_ORG_ID or pass --org")?,
    };
    let session_key = credentials
        .session_key()
        .context("no session key; run with --login or set PROJMIRROR_SESSION_KEY")?;
    let client = ProjectClient::with_base_url(&config.api_url, session_key)?;

    let context = AppContext {
        organization_id,
        config,
    };
    let (handle, notifications, service) = SyncService::spawn(context, store, client);
    if let Some(project) = args.project {
        handle.set_current_project(project).await?;
    }

    match args.mode {
        CliMode::Projects => {
            for project in handle.list_projects().await? {
                println!("{}\t{}", project.uuid, project.name);
            }
        }
        CliMode::List => print_items(&handle.get_tracked_items().await?),
        _ => {
            let presenter = tokio::spawn(
                Presenter::new().run(notifications, |summary| println!("{summary}")),
            );
            let mut items = handle.get_tracked_items().await?;
            if !args.paths.is_empty() {
                let selected = args
                    .paths
                    .iter()
                    .map(std::path::absolute)
                    .collect::<Result<Vec<_>, _>>()
                    .context("failed to resolve paths")?;
                items = handle
                    .select_files_and_folders(Some(selected), items)
                    .await?;
            }
            let roots: Vec<PathBuf> = items
                .iter()
                .filter(|item| !item.ignored)
                .map(|item| item.path.clone())
                .collect();
            handle.start_sync(roots).await?;
            info!("syncing; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            handle.stop_sync().await?;
            drop(handle);
            service.await.context("sync service task failed")?;
            presenter.await.context("presenter task failed")?;
            return Ok(());
        }
    }

    drop(handle);
    service.await.context("sync service task failed")?;
    Ok(())
}
