#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use newfs_block::DeviceConfig;
use newfs_core::{FileType, FsError, InodeAttr, NewFs, Usage};
use newfs_fuse::MountOptions;
use serde::Serialize;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct InspectOutput {
    device: String,
    formatted_now: bool,
    block_size: u32,
    io_size: u32,
    inode_count: u32,
    data_offset: u32,
    data_count: u32,
    root_ino: u32,
    usage: Usage,
}

/// Parsed command line: positional arguments plus the recognized flags.
#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    positional: Vec<String>,
    device: Option<String>,
    json: bool,
    allow_other: bool,
}

impl CliArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut out = Self::default();
        for arg in args {
            if let Some(path) = arg.strip_prefix("--device=") {
                if path.is_empty() {
                    bail!("--device= requires a path");
                }
                out.device = Some(path.to_owned());
            } else if arg == "--json" {
                out.json = true;
            } else if arg == "--allow-other" {
                out.allow_other = true;
            } else if arg.starts_with("--") {
                bail!("unknown option: {arg}");
            } else {
                out.positional.push(arg);
            }
        }
        Ok(out)
    }

    fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            path: resolve_device(self.device.as_deref(), env::var_os("HOME")),
            ..DeviceConfig::default()
        }
    }

    fn require(&self, idx: usize, what: &str) -> Result<&str> {
        match self.positional.get(idx) {
            Some(value) => Ok(value.as_str()),
            None => bail!("missing {what} argument"),
        }
    }
}

/// `--device=` wins, then `$HOME/ddriver`, then `./ddriver`.
fn resolve_device(flag: Option<&str>, home: Option<OsString>) -> PathBuf {
    match (flag, home) {
        (Some(path), _) => PathBuf::from(path),
        (None, Some(home)) if !home.is_empty() => Path::new(&home).join("ddriver"),
        (None, _) => PathBuf::from("ddriver"),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    if matches!(command.as_str(), "--help" | "-h" | "help") {
        print_usage();
        return Ok(());
    }
    let cli = CliArgs::parse(args)?;

    match command.as_str() {
        "mount" => {
            let mountpoint = cli.require(0, "mountpoint")?;
            mount_cmd(&cli.device_config(), Path::new(mountpoint), cli.allow_other)
        }
        "inspect" => with_fs(&cli, |fs, config| inspect(fs, config, cli.json)),
        "ls" => {
            let path = cli.require(0, "path")?.to_owned();
            with_fs(&cli, |fs, _| ls(fs, &path))
        }
        "stat" => {
            let path = cli.require(0, "path")?.to_owned();
            with_fs(&cli, |fs, _| stat(fs, &path, cli.json))
        }
        "mkdir" => {
            let path = cli.require(0, "path")?.to_owned();
            with_fs(&cli, |fs, _| {
                fs.create_dir(&path)
                    .with_context(|| format!("mkdir {path}"))
                    .map(|_| ())
            })
        }
        "touch" => {
            let path = cli.require(0, "path")?.to_owned();
            with_fs(&cli, |fs, _| touch(fs, &path))
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("newfs\n");
    println!("USAGE:");
    println!("  newfs mount <mountpoint> [--device=PATH] [--allow-other]");
    println!("  newfs inspect [--device=PATH] [--json]");
    println!("  newfs ls <path> [--device=PATH]");
    println!("  newfs stat <path> [--device=PATH] [--json]");
    println!("  newfs mkdir <path> [--device=PATH]");
    println!("  newfs touch <path> [--device=PATH]");
    println!();
    println!("The device defaults to $HOME/ddriver and is formatted on first use.");
}

/// Mount the device, run `f`, then unmount even if `f` failed.
fn with_fs(
    cli: &CliArgs,
    f: impl FnOnce(&mut NewFs, &DeviceConfig) -> Result<()>,
) -> Result<()> {
    let config = cli.device_config();
    tracing::debug!(target: "newfs::cli", device = %config.path.display(), "device_resolved");
    let mut fs = NewFs::mount(&config)
        .with_context(|| format!("failed to mount device {}", config.path.display()))?;
    let result = f(&mut fs, &config);
    let unmounted = fs.unmount().context("failed to unmount device");
    result.and(unmounted)
}

fn inspect(fs: &mut NewFs, config: &DeviceConfig, json: bool) -> Result<()> {
    let geo = fs.geometry();
    let output = InspectOutput {
        device: config.path.display().to_string(),
        formatted_now: fs.was_formatted(),
        block_size: geo.block_size,
        io_size: fs.io_size(),
        inode_count: geo.inode_count,
        data_offset: geo.data.offset,
        data_count: geo.data_count,
        root_ino: geo.root_ino.0,
        usage: fs.usage(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("newfs inspector");
        println!("device: {}", output.device);
        if output.formatted_now {
            println!("(device had no newfs superblock and was formatted)");
        }
        println!("block_size: {}", output.block_size);
        println!("io_size: {}", output.io_size);
        println!(
            "inodes: {}/{} used",
            output.usage.inodes_used, output.usage.inodes_total
        );
        println!(
            "data blocks: {}/{} used (region starts at block {})",
            output.usage.blocks_used, output.usage.blocks_total, output.data_offset
        );
        println!("root_ino: {}", output.root_ino);
        if output.usage.stranded_blocks > 0 {
            println!(
                "stranded blocks: {} (beyond data bitmap coverage)",
                output.usage.stranded_blocks
            );
        }
    }
    Ok(())
}

fn ls(fs: &mut NewFs, path: &str) -> Result<()> {
    let entries = fs
        .read_dir(path)
        .with_context(|| format!("cannot list {path}"))?;
    for entry in entries {
        let marker = match entry.kind {
            FileType::Directory => "d",
            FileType::RegularFile => "-",
        };
        println!("{marker} {:>5} {}", entry.ino.0, entry.name);
    }
    Ok(())
}

fn stat(fs: &mut NewFs, path: &str, json: bool) -> Result<()> {
    let attr: InodeAttr = fs
        .getattr(path)
        .with_context(|| format!("cannot stat {path}"))?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&attr).context("serialize output")?
        );
    } else {
        println!("path: {path}");
        println!("ino: {}", attr.ino.0);
        println!("kind: {:?}", attr.kind);
        println!("mode: {:o}", attr.mode);
        println!("size: {}", attr.size);
        println!("nlink: {}", attr.nlink);
        println!("blocks: {}", attr.blocks);
    }
    Ok(())
}

/// Create an empty file; an existing entry is left alone.
fn touch(fs: &mut NewFs, path: &str) -> Result<()> {
    match fs.create_file(path) {
        Ok(_) => Ok(()),
        Err(FsError::Exists) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("touch {path}")),
    }
}

fn mount_cmd(config: &DeviceConfig, mountpoint: &Path, allow_other: bool) -> Result<()> {
    let fs = NewFs::mount(config)
        .with_context(|| format!("failed to mount device {}", config.path.display()))?;
    let usage = fs.usage();
    eprintln!(
        "Mounting newfs (inodes {}/{}, data blocks {}/{}) at {}",
        usage.inodes_used,
        usage.inodes_total,
        usage.blocks_used,
        usage.blocks_total,
        mountpoint.display()
    );

    let opts = MountOptions {
        allow_other,
        ..MountOptions::default()
    };
    newfs_fuse::mount(fs, mountpoint, &opts)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;
    Ok(())
}
