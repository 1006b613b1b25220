use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::Parser;
use cx88_sdr::{
    args::{convert_filter, Args},
    controller::{PixelFormat, TUNER_SDR},
    pool::Geometry,
    regs::{self, MappedWindow},
    sim::{SimPci, Tone},
    DeviceRegistry, DriverParams, Error, ReadMode, PAGE_SIZE,
};
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use std::{
    cmp::min,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};
use tracing::{info, warn};

/// Bytes moved per read
const CHUNK_SIZE: usize = 16 * PAGE_SIZE;
/// Chunks buffered between the reader and the file writer
const PIPELINE_DEPTH: usize = 256;
/// Test tone offset from DC, as a fraction of the sample rate
const TONE_FRACTION: f32 = 1.0 / 16.0;

enum Chunk {
    Data(Vec<u8>),
    End,
}

fn push(producer: &mut Producer<Chunk>, mut chunk: Chunk) {
    loop {
        match producer.push(chunk) {
            Ok(()) => return,
            Err(PushError::Full(c)) => {
                chunk = c;
                thread::yield_now();
            }
        }
    }
}

/// Drain the pipeline into `path`. Keeps draining after a write error so the
/// capture side never stalls on a full ring.
fn file_writer(path: PathBuf, mut consumer: Consumer<Chunk>) -> std::io::Result<u64> {
    let mut file = BufWriter::new(File::create(&path)?);
    let mut written = 0u64;
    let mut failed = None;
    loop {
        let chunk = match consumer.pop() {
            Ok(c) => c,
            Err(_) => {
                thread::yield_now();
                continue;
            }
        };
        match chunk {
            Chunk::Data(bytes) => {
                if failed.is_some() {
                    continue;
                }
                match file.write_all(&bytes) {
                    Ok(()) => written += bytes.len() as u64,
                    Err(e) => failed = Some(e),
                }
            }
            Chunk::End => break,
        }
    }
    if let Some(e) = failed {
        return Err(e);
    }
    file.flush()?;
    Ok(written)
}

fn dump_registers(path: &Path) -> anyhow::Result<()> {
    let window = MappedWindow::open(path)
        .with_context(|| format!("mapping {}", path.display()))?;
    for (name, offset, value) in regs::snapshot(&window) {
        println!("{:<20} {:#08x}: {:#010x}", name, offset, value);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    if let Some(path) = &args.dump_registers {
        return dump_registers(path);
    }

    let params = DriverParams {
        latency: args.latency,
        geometry: Geometry::with_capacity(args.capacity * 1024 * 1024),
        ..Default::default()
    };
    let poll_interval = params.poll_interval;
    let mut registry = DeviceRegistry::new(params);

    // Bring up a simulated card
    let pci = SimPci::new();
    let chip = Arc::new(pci.chip());
    let (device, handler) = registry
        .probe(Box::new(pci))
        .context("probing the capture card")?;
    chip.connect_irq(handler);

    let format = PixelFormat::from(args.format);
    device.set_format(format.fourcc());
    if let Some(hz) = args.frequency {
        device.set_frequency(0, TUNER_SDR, hz)?;
    }
    device.set_gain(args.gain)?;
    device.set_input(args.input)?;
    device.log_status();

    let sample_rate = device.frequency(0)?.frequency;
    chip.set_source(Box::new(Tone::new(
        format,
        sample_rate as f32 * TONE_FRACTION,
        sample_rate as f32,
    )));
    let _running = chip
        .clone()
        .spawn(PAGE_SIZE, sample_rate as u64 * format.bytes_per_sample() as u64);

    let mode = if args.non_blocking {
        ReadMode::NonBlocking
    } else {
        ReadMode::Blocking
    };
    let mut session = device.open(mode).context("opening a capture session")?;

    let stop = Arc::new(AtomicBool::new(false));
    let canceller = session.canceller();
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Release);
        canceller.cancel();
    })
    .context("installing the Ctrl-C handler")?;

    let path = args.output.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "cx88sdr-{}.raw",
            Utc::now().format("%Y-%m-%dT%H-%M-%S")
        ))
    });
    info!("Capturing {} bytes to {}", args.bytes, path.display());

    let (mut producer, consumer) = RingBuffer::new(PIPELINE_DEPTH).split();
    let writer = thread::spawn(move || file_writer(path, consumer));

    let start = Instant::now();
    let mut remaining = args.bytes;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 && !stop.load(Ordering::Acquire) {
        let want = min(remaining, CHUNK_SIZE as u64) as usize;
        match session.read(&mut buf[..want]) {
            Ok(n) => {
                push(&mut producer, Chunk::Data(buf[..n].to_vec()));
                remaining -= n as u64;
            }
            Err(Error::WouldBlock) => thread::sleep(poll_interval),
            Err(Error::Interrupted { copied }) => {
                push(&mut producer, Chunk::Data(buf[..copied].to_vec()));
                warn!("Capture interrupted");
                break;
            }
            Err(e) => {
                push(&mut producer, Chunk::End);
                return Err(e).context("reading samples");
            }
        }
    }
    push(&mut producer, Chunk::End);
    let captured = session.position();
    drop(session);

    let written = writer
        .join()
        .map_err(|_| anyhow!("file writer panicked"))?
        .context("writing samples")?;
    let secs = start.elapsed().as_secs_f64();
    info!(
        "Captured {} bytes ({} written) in {:.2} s, {:.1} MB/s",
        captured,
        written,
        secs,
        captured as f64 / secs / 1e6
    );
    registry.remove(device.nr());
    Ok(())
}
