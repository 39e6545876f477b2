use clap::{Args, Parser, Subcommand};
use flotilla_proto::{RANDOM_UUID, VmInfo};
use std::path::PathBuf;

/// Version keyword resolved against the local image index.
pub const LATEST: &str = "latest";

#[derive(Parser, Debug)]
#[command(name = "flotilla", about = "Local fleet manager for lightweight VMs")]
pub struct Cli {
    /// Path to the daemon config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Control the background daemon
    Server {
        #[command(subcommand)]
        action: ServerCommand,
    },

    /// Show whether the daemon is up
    Status,

    /// List VMs
    Ps {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Include VMs that are still booting or halting
        #[arg(short, long)]
        all: bool,
    },

    /// Print one attribute of a VM
    Query {
        /// UUID or name
        target: String,

        #[command(flatten)]
        field: QueryField,
    },

    /// Boot a new VM
    Run(RunArgs),

    /// Halt VMs by UUID or name
    Kill {
        targets: Vec<String>,

        /// Halt every VM
        #[arg(short, long, conflicts_with = "targets")]
        all: bool,
    },

    /// Manage locally stored images
    Images {
        #[command(subcommand)]
        action: ImagesCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
    /// Run the daemon in the foreground (requires root)
    Start,
    /// Ask a running daemon to exit
    Stop,
}

#[derive(Args, Debug, Default)]
#[group(multiple = false)]
pub struct QueryField {
    /// Public IP address
    #[arg(long)]
    pub ip: bool,

    /// Console tty path
    #[arg(long)]
    pub tty: bool,

    /// Runner log path
    #[arg(long)]
    pub log: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image channel
    #[arg(short = 'C', long, default_value = "alpha")]
    pub channel: String,

    /// Image version, or `latest`
    #[arg(short = 'V', long, default_value = LATEST)]
    pub version: String,

    /// Requested UUID; `random` picks a fresh one
    #[arg(long, default_value = RANDOM_UUID)]
    pub uuid: String,

    /// Friendly name (defaults to the UUID)
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// Memory in MB
    #[arg(short, long, default_value_t = 1024)]
    pub memory: u64,

    /// Virtual CPUs
    #[arg(short = 'c', long, default_value_t = 1)]
    pub cpus: u32,

    /// Root volume
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Additional volumes, attached in order
    #[arg(long = "volume")]
    pub volumes: Vec<PathBuf>,

    /// ISO image to attach as cdrom
    #[arg(long)]
    pub cdrom: Option<PathBuf>,

    /// Extra kernel command line
    #[arg(short, long, default_value = "")]
    pub boot: String,

    /// Extra arguments passed to the runner
    #[arg(long = "extra", allow_hyphen_values = true)]
    pub extra: Vec<String>,
}

impl RunArgs {
    /// Everything attached to the VM, root volume first.
    pub fn volumes(&self) -> Vec<PathBuf> {
        self.root.iter().chain(&self.volumes).cloned().collect()
    }

    /// Request body for `vm:run`. Paths must already be absolute.
    pub fn to_draft(&self, version: &str, storage: Vec<String>, cdrom: Option<String>) -> VmInfo {
        let mut vm = VmInfo::draft(&self.channel, version);
        vm.uuid = self.uuid.clone();
        vm.name = self.name.clone();
        vm.memory_mb = self.memory;
        vm.cpus = self.cpus;
        vm.storage = storage;
        vm.cdrom = cdrom;
        vm.extra_kernel_args = self.boot.clone();
        vm.extra_runner_args = self.extra.clone();
        vm
    }
}

#[derive(Subcommand, Debug)]
pub enum ImagesCommand {
    /// List local images
    Ls {
        /// Channel to list
        #[arg(short = 'C', long, default_value = "alpha")]
        channel: String,

        /// Browse every channel
        #[arg(short, long, conflicts_with = "channel")]
        all: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete local images
    Rm {
        #[arg(short = 'C', long, default_value = "alpha")]
        channel: String,

        /// Version to delete, or `latest`
        #[arg(short = 'V', long, required_unless_present = "old")]
        version: Option<String>,

        /// Delete every version but the newest
        #[arg(long, conflicts_with = "version")]
        old: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("flotilla").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn run_defaults() {
        let Command::Run(args) = parse(&["run"]).command else {
            panic!("expected run");
        };
        assert_eq!(args.channel, "alpha");
        assert_eq!(args.version, LATEST);
        assert_eq!(args.uuid, RANDOM_UUID);
        assert_eq!(args.memory, 1024);

        let draft = args.to_draft("1.2.3", Vec::new(), None);
        assert_eq!(draft.version, "1.2.3");
        assert_eq!(draft.pid, flotilla_proto::NO_PID);
    }

    #[test]
    fn root_volume_comes_first() {
        let Command::Run(args) = parse(&[
            "run", "--volume", "/b.img", "--root", "/a.img", "--extra", "-s", "--extra", "2:0,virtio-rnd",
        ])
        .command
        else {
            panic!("expected run");
        };
        assert_eq!(
            args.volumes(),
            [PathBuf::from("/a.img"), PathBuf::from("/b.img")]
        );
        assert_eq!(args.extra, ["-s", "2:0,virtio-rnd"]);
    }

    #[test]
    fn query_fields_are_exclusive() {
        assert!(Cli::try_parse_from(["flotilla", "query", "web", "--ip", "--tty"]).is_err());
        let Command::Query { target, field } = parse(&["query", "web", "--log"]).command else {
            panic!("expected query");
        };
        assert_eq!(target, "web");
        assert!(field.log && !field.ip);
    }

    #[test]
    fn kill_all_conflicts_with_targets() {
        assert!(Cli::try_parse_from(["flotilla", "kill", "web", "--all"]).is_err());
        assert!(matches!(
            parse(&["kill", "--all"]).command,
            Command::Kill { all: true, .. }
        ));
    }

    #[test]
    fn images_ls_defaults_to_alpha() {
        let Command::Images {
            action: ImagesCommand::Ls { channel, all, .. },
        } = parse(&["images", "ls"]).command
        else {
            panic!("expected images ls");
        };
        assert_eq!(channel, "alpha");
        assert!(!all);
        assert!(matches!(
            parse(&["images", "ls", "--all"]).command,
            Command::Images {
                action: ImagesCommand::Ls { all: true, .. }
            }
        ));
    }

    #[test]
    fn images_rm_needs_version_or_old() {
        assert!(Cli::try_parse_from(["flotilla", "images", "rm"]).is_err());
        assert!(matches!(
            parse(&["images", "rm", "--old"]).command,
            Command::Images {
                action: ImagesCommand::Rm { old: true, .. }
            }
        ));
    }
}
