use std::io::IsTerminal;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flotilla::cli::{Cli, Command, ImagesCommand, LATEST, RunArgs, ServerCommand};
use flotilla::client::{self, Session};
use flotilla::config::{self, DaemonConfig};
use flotilla::error::FleetError;
use flotilla::{daemon, logging, paths};
use flotilla_proto::{RANDOM_UUID, VmInfo};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let terminal_filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flotilla=info"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_filter(terminal_filter);

    // File layer: discards until the daemon knows its run root
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("flotilla=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(paths::config_file);
    let config = config::load_config(&config_path)?;

    match cli.command {
        Command::Server {
            action: ServerCommand::Start,
        } => {
            let log = paths::daemon_log(&config.run_root());
            if let Err(e) = file_handle.set_file(&log) {
                tracing::warn!("daemon log {} unavailable: {e}", log.display());
            }
            daemon::run_serve(config).await?;
        }
        Command::Server {
            action: ServerCommand::Stop,
        } => {
            let session = Session::open(&config).await?;
            println!("{}", session.server_stop().await?);
        }
        Command::Status => {
            let session = Session::open(&config).await?;
            let info = session.info();
            let vms = session.vm_list().await?;
            println!(
                "{} {} running (pid {}, started {}), {} VM(s)",
                info.name,
                info.version,
                info.pid,
                info.started_at,
                vms.len()
            );
        }
        Command::Ps { json, all } => {
            let session = Session::open(&config).await?;
            let vms = session.vm_list().await?;
            if json {
                let out = facet_json::to_string(&vms).map_err(encode)?;
                println!("{out}");
            } else {
                print!("{}", client::ps_table(&vms, all));
            }
        }
        Command::Query { target, field } => {
            let session = Session::open(&config).await?;
            let vms = session.vm_list().await?;
            let vm = client::find_vm(&vms, &target).ok_or_else(|| FleetError::Validation {
                message: format!("no VM matches '{target}'"),
            })?;
            let run_root = config.run_root();
            if field.ip {
                println!("{}", vm.public_ip);
            } else if field.tty {
                println!("{}", paths::tty_path(&run_root, &vm.uuid).display());
            } else if field.log {
                println!("{}", paths::log_path(&run_root, &vm.uuid).display());
            } else {
                println!("{}", vm.uuid);
            }
        }
        Command::Run(args) => {
            let session = Session::open(&config).await?;
            let draft = build_draft(&session, &args).await?;
            let vm = session.vm_run(draft).await?;
            println!("{} {} {}", vm.name, vm.uuid, vm.public_ip);
        }
        Command::Kill { targets, all } => {
            if targets.is_empty() && !all {
                return Err(FleetError::Validation {
                    message: "name the VMs to halt or pass --all".into(),
                }
                .into());
            }
            let session = Session::open(&config).await?;
            for uuid in session.vm_stop(targets).await? {
                println!("{uuid}");
            }
        }
        Command::Images { action } => images(&config, action).await?,
    }

    Ok(())
}

async fn build_draft(session: &Session, args: &RunArgs) -> Result<VmInfo, FleetError> {
    let version = if args.version == LATEST {
        let listed = session.images_list().await?;
        client::latest_version(&listed, &args.channel).ok_or_else(|| {
            FleetError::ImageNotFound {
                channel: args.channel.clone(),
                version: LATEST.into(),
            }
        })?
    } else {
        args.version.clone()
    };

    if args.uuid != RANDOM_UUID {
        let assigned = session.vm_uuid2mac(&args.uuid).await?;
        if !assigned.uuid.eq_ignore_ascii_case(&args.uuid) {
            tracing::warn!(requested = %args.uuid, "UUID unavailable, the daemon will pick another");
        }
    }

    let storage = args
        .volumes()
        .iter()
        .map(|p| client::absolutize(p))
        .collect::<Result<Vec<_>, _>>()?;
    let cdrom = args
        .cdrom
        .as_deref()
        .map(client::absolutize)
        .transpose()?;

    Ok(args.to_draft(&version, storage, cdrom))
}

async fn images(config: &DaemonConfig, action: ImagesCommand) -> Result<(), FleetError> {
    let session = Session::open(config).await?;
    match action {
        ImagesCommand::Ls { channel, all, json } => {
            let listed = session.images_list().await?;
            let listed = client::browse(listed, &channel, all);
            if json {
                let out = facet_json::to_string(&listed).map_err(encode)?;
                println!("{out}");
            } else {
                for c in &listed {
                    for v in &c.versions {
                        println!("{}/{v}", c.channel);
                    }
                }
            }
        }
        ImagesCommand::Rm {
            channel,
            version,
            old,
        } => {
            let listed = session.images_list().await?;
            let doomed = if old {
                client::old_versions(&listed, &channel)
            } else {
                match version.as_deref() {
                    Some(LATEST) | None => {
                        client::latest_version(&listed, &channel).into_iter().collect()
                    }
                    Some(v) => vec![v.to_string()],
                }
            };
            for v in doomed {
                session.images_remove(&channel, &v).await?;
                println!("removed {channel}/{v}");
            }
        }
    }
    Ok(())
}

fn encode(e: impl std::fmt::Debug) -> FleetError {
    FleetError::Encode {
        message: format!("{e:?}"),
    }
}
