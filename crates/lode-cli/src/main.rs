#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lode_block::FileByteDevice;
use lode_types::{mode_to_string, uuid_to_string};
use lode_volume::{TreeSelect, Volume};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lode", about = "LodeFS — read-only btrfs metadata explorer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show superblock and mount summary for an image.
    Inspect {
        /// Path to the filesystem image or block device.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Dump a metadata tree as text.
    Dump {
        image: PathBuf,
        /// Which tree to dump.
        #[arg(long, value_enum, default_value = "fs")]
        tree: TreeArg,
        /// FS/subvolume tree id (defaults to the default subvolume).
        #[arg(long)]
        subvol: Option<u64>,
    },
    /// Resolve a name within a directory to its object id.
    Resolve {
        image: PathBuf,
        /// Parent directory object id.
        parent: u64,
        /// Entry name.
        name: String,
        #[arg(long)]
        subvol: Option<u64>,
    },
    /// Show the file package (inode, name, extents) of one object.
    Stat {
        image: PathBuf,
        /// Object id to look up.
        object_id: u64,
        #[arg(long)]
        subvol: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// List a directory.
    Ls {
        image: PathBuf,
        /// Directory object id (defaults to the root directory).
        #[arg(default_value_t = lode_types::OBJID_ROOT_DIR)]
        object_id: u64,
        #[arg(long)]
        subvol: Option<u64>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TreeArg {
    Chunk,
    Root,
    Fs,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    label: String,
    fsid: String,
    generation: u64,
    superblock_copy: usize,
    sectorsize: u32,
    nodesize: u32,
    total_bytes: u64,
    bytes_used: u64,
    num_devices: u64,
    chunks: usize,
    root_items: usize,
    default_subvol: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LODE_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Dump {
            image,
            tree,
            subvol,
        } => dump(&image, tree, subvol),
        Command::Resolve {
            image,
            parent,
            name,
            subvol,
        } => resolve(&image, parent, &name, subvol),
        Command::Stat {
            image,
            object_id,
            subvol,
            json,
        } => stat(&image, object_id, subvol, json),
        Command::Ls {
            image,
            object_id,
            subvol,
            json,
        } => ls(&image, object_id, subvol, json),
    }
}

fn open_volume(path: &PathBuf) -> Result<Volume<FileByteDevice>> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    Volume::mount(dev).with_context(|| format!("failed to mount btrfs volume: {}", path.display()))
}

fn inspect(path: &PathBuf, json: bool) -> Result<()> {
    let volume = open_volume(path)?;
    let sb = volume.superblock();

    let output = InspectOutput {
        label: sb.label.clone(),
        fsid: uuid_to_string(&sb.fsid),
        generation: sb.generation,
        superblock_copy: volume.superblock_copy(),
        sectorsize: sb.sectorsize,
        nodesize: sb.nodesize,
        total_bytes: sb.total_bytes,
        bytes_used: sb.bytes_used,
        num_devices: sb.num_devices,
        chunks: volume.chunks().len(),
        root_items: volume.root_items().len(),
        default_subvol: volume.default_subvol(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("label: {}", output.label);
        println!("fsid: {}", output.fsid);
        println!("generation: {}", output.generation);
        println!("superblock_copy: {}", output.superblock_copy);
        println!("sectorsize: {}", output.sectorsize);
        println!("nodesize: {}", output.nodesize);
        println!("total_bytes: {}", output.total_bytes);
        println!("bytes_used: {}", output.bytes_used);
        println!("num_devices: {}", output.num_devices);
        println!("chunks: {}", output.chunks);
        println!("root_items: {}", output.root_items);
        println!("default_subvol: {}", output.default_subvol);
    }

    Ok(())
}

fn fs_tree(volume: &Volume<FileByteDevice>, subvol: Option<u64>) -> u64 {
    subvol.unwrap_or_else(|| volume.default_subvol())
}

fn dump(path: &PathBuf, tree: TreeArg, subvol: Option<u64>) -> Result<()> {
    let volume = open_volume(path)?;
    let select = match tree {
        TreeArg::Chunk => TreeSelect::Chunk,
        TreeArg::Root => TreeSelect::Root,
        TreeArg::Fs => TreeSelect::Fs(fs_tree(&volume, subvol)),
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    volume.dump_tree(select, &mut out).context("dump tree")?;
    out.flush()?;
    Ok(())
}

fn resolve(path: &PathBuf, parent: u64, name: &str, subvol: Option<u64>) -> Result<()> {
    let volume = open_volume(path)?;
    let tree = fs_tree(&volume, subvol);
    let child = volume
        .name_to_id(tree, parent, name)
        .with_context(|| format!("'{name}' not found under {parent}"))?;
    println!("{child}");
    Ok(())
}

fn stat(path: &PathBuf, object_id: u64, subvol: Option<u64>, json: bool) -> Result<()> {
    let volume = open_volume(path)?;
    let tree = fs_tree(&volume, subvol);
    let pkg = volume
        .file_pkg(tree, object_id)
        .with_context(|| format!("object {object_id} not found in tree {tree}"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&pkg).context("serialize file pkg")?
        );
        return Ok(());
    }

    println!("object_id: {}", pkg.object_id);
    println!("parent_id: {}", pkg.parent_id);
    println!("name: {}", pkg.name);
    println!("mode: {}", mode_to_string(pkg.inode.mode));
    println!("size: {}", pkg.inode.size);
    println!("uid: {}  gid: {}  nlink: {}", pkg.inode.uid, pkg.inode.gid, pkg.inode.nlink);
    println!("hidden: {}", pkg.hidden);
    println!("extents: {}", pkg.num_extents());
    Ok(())
}

fn ls(path: &PathBuf, object_id: u64, subvol: Option<u64>, json: bool) -> Result<()> {
    let volume = open_volume(path)?;
    let tree = fs_tree(&volume, subvol);
    let list = volume
        .dir_list(tree, object_id)
        .with_context(|| format!("directory {object_id} not found in tree {tree}"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&list).context("serialize dir list")?
        );
        return Ok(());
    }

    for entry in &list.entries {
        println!(
            "{} {:>10} {:>6} {}",
            mode_to_string(entry.inode.mode),
            entry.inode.size,
            entry.object_id,
            entry.name
        );
    }
    Ok(())
}
