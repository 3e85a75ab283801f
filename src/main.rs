//! helium - a lightweight micro-VMM for statically-linked unikernel guests.
//!
//! helium boots a single unikernel image on the host's KVM accelerator,
//! services its hypercalls (file and network I/O, command-line forwarding,
//! exit), and supports two orthogonal state-transfer mechanisms:
//! checkpoint/restore to disk and live migration to a peer instance.
//!
//! Configuration comes from `HERMIT_*` environment variables; the command
//! line carries only the guest image path and the arguments forwarded to
//! the guest. A JSON control socket (`/tmp/uhyve.sock`) accepts runtime
//! tasks: start an application, create or load a checkpoint, migrate.
//!
//! This VMM requires Linux with KVM support. It will not run elsewhere.

#[cfg(target_os = "linux")]
mod checkpoint;
#[cfg(target_os = "linux")]
mod config;
#[cfg(target_os = "linux")]
mod hypercall;
#[cfg(target_os = "linux")]
mod hypervisor;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod loader;
#[cfg(target_os = "linux")]
mod mem;
#[cfg(target_os = "linux")]
mod migration;
#[cfg(target_os = "linux")]
mod monitor;
#[cfg(target_os = "linux")]
mod net;
#[cfg(target_os = "linux")]
mod paging;
#[cfg(target_os = "linux")]
mod vcpu;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "helium")]
#[command(about = "A lightweight micro-VMM for statically-linked unikernel guests")]
struct Args {
    /// Path to the guest image. May be omitted; the monitor's "start app"
    /// task can supply one later.
    image: Option<PathBuf>,

    /// Arguments forwarded to the guest application.
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(code) => ExitCode::from((code & 0xff) as u8),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<i32, Box<dyn std::error::Error>> {
    use std::ops::Range;
    use std::path::Path;
    use std::sync::mpsc;
    use std::sync::Arc;

    use checkpoint::Manifest;
    use config::{Config, MIGRATION_PORT};
    use hypervisor::{Hypervisor, HypervisorError, HypervisorParts, StartMode};
    use loader::LoadedImage;
    use mem::GuestMemory;
    use monitor::{MonitorShared, PreStartRequest, PreStartTask};

    init_tracing();
    let config = Config::from_env()?;

    // Must precede every thread spawn so the mask is inherited everywhere.
    migration::block_trigger_signal();

    if config.debug {
        tracing::warn!("HERMIT_DEBUG is set, but this build carries no debug stub");
    }

    // The walker's identity fast path only exists on ARMv8, where
    // boot-time translations precede the guest's own tables.
    fn identity_range(loaded: &LoadedImage) -> Option<Range<u64>> {
        if cfg!(target_arch = "aarch64") {
            Some(loaded.static_mem_start..loaded.static_mem_start + loaded.static_mem_size)
        } else {
            None
        }
    }

    // Fresh boot from an image.
    fn build_boot(
        config: Config,
        image: PathBuf,
        extra_args: Vec<String>,
    ) -> Result<Arc<Hypervisor>, HypervisorError> {
        let mem = GuestMemory::new(config.guest_size, config.mergeable, config.hugepage)?;
        let vm = kvm::create_vm()?;
        vm.register_memory(&mem)?;

        let loaded = loader::load_image(&mem, &image, &config)?;
        tracing::info!(
            image = %image.display(),
            entry = format_args!("{:#x}", loaded.entry),
            "guest image loaded"
        );

        let mut guest_args = vec![image.display().to_string()];
        guest_args.extend(extra_args);

        Hypervisor::new(HypervisorParts {
            identity_range: identity_range(&loaded),
            elf_entry: loaded.entry,
            mboot: loaded.mboot,
            klog: loaded.klog,
            start_mode: StartMode::Boot,
            guest_args,
            restore_states: None,
            checkpoint_dir: PathBuf::from(checkpoint::DEFAULT_DIR),
            checkpoint_counter: 0,
            config,
            mem,
            vm,
        })
    }

    // Restart from an on-disk checkpoint.
    fn build_from_checkpoint(
        mut config: Config,
        manifest: Manifest,
        dir: PathBuf,
        extra_args: Vec<String>,
    ) -> Result<Arc<Hypervisor>, HypervisorError> {
        tracing::info!(
            generation = manifest.checkpoint_number,
            ncores = manifest.ncores,
            "restarting from checkpoint"
        );
        config.ncores = manifest.ncores;
        config.guest_size = manifest.guest_size;
        config.full_checkpoint = manifest.full;

        let mem = GuestMemory::new(config.guest_size, config.mergeable, config.hugepage)?;
        let vm = kvm::create_vm()?;
        vm.register_memory(&mem)?;

        checkpoint::restore_memory(&mem, Some(&vm), &dir, &manifest)?;

        let mut guest_args = vec![manifest.application.display().to_string()];
        guest_args.extend(extra_args);

        let entry = manifest.entry_point;
        Hypervisor::new(HypervisorParts {
            elf_entry: entry,
            mboot: entry,
            klog: entry + loader::hdr::KLOG_OFFSET,
            identity_range: None,
            start_mode: StartMode::RestoreCheckpoint {
                generation: manifest.checkpoint_number,
            },
            guest_args,
            restore_states: None,
            checkpoint_dir: dir,
            checkpoint_counter: manifest.checkpoint_number + 1,
            config,
            mem,
            vm,
        })
    }

    // Become the destination of an incoming migration.
    fn build_from_migration(
        mut config: Config,
        incoming: migration::IncomingMigration,
        extra_args: Vec<String>,
    ) -> Result<Arc<Hypervisor>, HypervisorError> {
        let metadata = incoming.metadata;
        config.ncores = metadata.ncores;
        config.guest_size = metadata.guest_size;
        config.full_checkpoint = metadata.full_checkpoint != 0;

        let mem = GuestMemory::new(config.guest_size, config.mergeable, config.hugepage)?;
        let vm = kvm::create_vm()?;
        vm.register_memory(&mem)?;

        let states = incoming.receive_guest(&mem, &vm)?;

        let entry = metadata.elf_entry;
        Hypervisor::new(HypervisorParts {
            elf_entry: entry,
            mboot: entry,
            klog: entry + loader::hdr::KLOG_OFFSET,
            identity_range: None,
            start_mode: StartMode::RestoreMigration,
            guest_args: extra_args,
            restore_states: Some(states),
            checkpoint_dir: PathBuf::from(checkpoint::DEFAULT_DIR),
            checkpoint_counter: metadata.no_checkpoint,
            config,
            mem,
            vm,
        })
    }

    // Block until the monitor delivers a usable start task.
    fn wait_for_start(
        config: &Config,
        extra_args: &[String],
        requests: mpsc::Receiver<PreStartRequest>,
    ) -> Result<Arc<Hypervisor>, HypervisorError> {
        loop {
            let request = requests.recv().map_err(|_| {
                HypervisorError::Io(std::io::Error::other("monitor thread went away"))
            })?;

            let built = match &request.task {
                PreStartTask::StartApp(path) => {
                    build_boot(config.clone(), path.clone(), extra_args.to_vec())
                }
                PreStartTask::LoadCheckpoint(dir) => match Manifest::load(dir) {
                    Ok(Some(manifest)) => build_from_checkpoint(
                        config.clone(),
                        manifest,
                        dir.clone(),
                        extra_args.to_vec(),
                    ),
                    Ok(None) => {
                        tracing::warn!(dir = %dir.display(), "no checkpoint in directory");
                        let _ = request.reply.send(400);
                        continue;
                    }
                    Err(e) => Err(e.into()),
                },
            };

            match built {
                Ok(hv) => {
                    let _ = request.reply.send(200);
                    return Ok(hv);
                }
                Err(e) => {
                    tracing::error!("start task failed: {e}");
                    let _ = request.reply.send(500);
                }
            }
        }
    }

    // Three ways in: incoming migration, checkpoint restart, fresh boot —
    // plus deferred start through the monitor when no image is given.
    let guest_args = args.guest_args.clone();
    let (shared, hv) = if config.migration_server {
        let incoming = migration::wait_for_incoming(MIGRATION_PORT)?;
        let hv = build_from_migration(config.clone(), incoming, guest_args)?;
        let shared = MonitorShared::new();
        monitor::spawn(Arc::clone(&shared))?;
        (shared, hv)
    } else if let Some(manifest) = Manifest::load(Path::new(checkpoint::DEFAULT_DIR))? {
        let dir = PathBuf::from(checkpoint::DEFAULT_DIR);
        let hv = build_from_checkpoint(config.clone(), manifest, dir, guest_args)?;
        let shared = MonitorShared::new();
        monitor::spawn(Arc::clone(&shared))?;
        (shared, hv)
    } else if let Some(image) = args.image.clone() {
        let hv = build_boot(config.clone(), image, guest_args)?;
        let shared = MonitorShared::new();
        monitor::spawn(Arc::clone(&shared))?;
        (shared, hv)
    } else {
        let (sender, receiver) = mpsc::channel();
        let shared = MonitorShared::with_prestart(sender);
        monitor::spawn(Arc::clone(&shared))?;
        tracing::info!("no image given; waiting for a monitor start task");
        let hv = wait_for_start(&config, &guest_args, receiver)?;
        (shared, hv)
    };

    shared.attach_hypervisor(Arc::clone(&hv));

    if hv.config.checkpoint_interval > 0 {
        checkpoint::spawn_interval_initiator(Arc::clone(&hv), hv.config.checkpoint_interval);
    }
    if let Some(target) = hv.config.migration_target.clone() {
        migration::spawn_signal_initiator(Arc::clone(&hv), target, hv.config.migration_params);
    }

    Ok(hv.run()?)
}

#[cfg(target_os = "linux")]
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let verbose = std::env::var("HERMIT_VERBOSE").map_or(false, |v| v != "0");
    let default = if verbose { "helium=debug" } else { "helium=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<i32, Box<dyn std::error::Error>> {
    Err("helium requires Linux with KVM support. This platform is not supported.".into())
}
