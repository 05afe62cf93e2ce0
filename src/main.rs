use std::net::TcpListener;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

mod cart;

use cart::net::{self, NetController};
use cart::{CartDriver, Controller, FileHandle, Geometry, MemoryController};

#[derive(Parser, Debug)]
#[command(about = "Byte-stream files on single-mount cartridge media")]
struct Cli {
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Write files through the driver, read them back and verify
    Run(RunArgs),
    /// Serve in-memory cartridge media over TCP
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3333")]
        listen: String,

        #[command(flatten)]
        geometry: GeometryArgs,
    },
}

#[derive(Args, Debug)]
struct GeometryArgs {
    /// Bytes per frame
    #[arg(long, default_value_t = cart::CART_FRAME_SIZE)]
    frame_size: usize,

    #[arg(long, default_value_t = cart::CART_CARTRIDGE_SIZE)]
    frames_per_cartridge: u32,

    #[arg(long, default_value_t = cart::CART_MAX_CARTRIDGES)]
    cartridges: u32,

    /// Size of the open file table
    #[arg(long, default_value_t = cart::CART_MAX_TOTAL_FILES)]
    max_files: usize,
}

impl From<&GeometryArgs> for Geometry {
    fn from(args: &GeometryArgs) -> Self {
        Geometry {
            frame_size: args.frame_size,
            frames_per_cartridge: args.frames_per_cartridge,
            cartridges: args.cartridges,
            max_files: args.max_files,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Controller address (host:port); in-memory media when absent
    #[arg(long)]
    server: Option<String>,

    /// Frames held by the cache
    #[arg(long)]
    cache_frames: Option<usize>,

    /// Number of files to write
    #[arg(long, default_value_t = 4)]
    files: usize,

    /// Bytes written to each file
    #[arg(long, default_value_t = 10_000)]
    bytes: usize,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[command(flatten)]
    geometry: GeometryArgs,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.action {
        Action::Run(args) => {
            let geometry = Geometry::from(&args.geometry);
            match &args.server {
                Some(addr) => {
                    let mut driver = CartDriver::new(NetController::new(addr.as_str()), geometry)?;
                    run(&mut driver, &args)
                }
                None => {
                    let mut driver = CartDriver::new(MemoryController::new(geometry), geometry)?;
                    run(&mut driver, &args)?;
                    let bus = driver.controller().counters();
                    println!(
                        "controller: {} mounts, {} zeroes, {} frame reads, {} frame writes",
                        bus.mounts, bus.zeroes, bus.reads, bus.writes
                    );
                    Ok(())
                }
            }
        }
        Action::Serve { listen, geometry } => {
            let geometry = Geometry::from(&geometry);
            geometry.validate()?;
            let listener =
                TcpListener::bind(&listen).with_context(|| format!("binding {listen}"))?;
            info!("serving cartridge media on {listen}");
            let mut ctrl = MemoryController::new(geometry);
            net::serve(&listener, &mut ctrl, geometry.frame_size)?;
            Ok(())
        }
    }
}

/// Write every file in uneven chunks, then reopen and read it back in
/// different chunks.
fn run<C: Controller>(driver: &mut CartDriver<C>, args: &RunArgs) -> Result<()> {
    if let Some(frames) = args.cache_frames {
        driver.set_cache_size(frames)?;
    }
    driver.power_on().context("powering on")?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let frame_size = driver.geometry().frame_size;
    let mut payloads = Vec::with_capacity(args.files);

    for i in 0..args.files {
        let path = format!("file{i}");
        let mut payload = vec![0u8; args.bytes];
        rng.fill(&mut payload[..]);

        let fd = driver.open(&path)?;
        let mut done = 0;
        while done < payload.len() {
            let chunk = rng.random_range(1..=2 * frame_size).min(payload.len() - done);
            driver
                .write(fd, &payload[done..done + chunk])
                .with_context(|| format!("writing {path} at {done}"))?;
            done += chunk;
        }
        driver.close(fd)?;
        payloads.push((path, payload));
    }

    for (path, payload) in &payloads {
        let fd = driver.open(path)?;
        let mut back = Vec::with_capacity(payload.len());
        loop {
            let want = rng.random_range(1..=3 * frame_size);
            let got = driver
                .read(fd, want)
                .with_context(|| format!("reading {path}"))?;
            if got.is_empty() {
                break;
            }
            back.extend_from_slice(&got);
        }
        if back != *payload || driver.position(fd)? != driver.len(fd)? {
            bail!("{path}: read back {} bytes that differ from what was written", back.len());
        }
        check_tail(driver, fd, payload, &mut rng).with_context(|| format!("seeking in {path}"))?;
        println!(
            "{path}: {} bytes in {} frames verified",
            driver.len(fd)?,
            driver.frames(fd)?.len()
        );
        driver.close(fd)?;
    }

    let stats = driver.cache_stats();
    println!(
        "cache: {} hits, {} misses, {} evictions; {} cartridge switches",
        stats.hits,
        stats.misses,
        stats.evictions,
        driver.mount_switches()
    );
    driver.power_off().context("powering off")?;
    Ok(())
}

/// Seek to a random offset and check that the rest of the file reads back.
fn check_tail<C: Controller>(
    driver: &mut CartDriver<C>,
    fd: FileHandle,
    payload: &[u8],
    rng: &mut StdRng,
) -> Result<()> {
    let offset = rng.random_range(0..=payload.len());
    driver.seek(fd, offset)?;
    let tail = driver.read(fd, payload.len())?;
    if tail != payload[offset..] {
        bail!("{} bytes read from offset {offset} do not match", tail.len());
    }
    Ok(())
}
