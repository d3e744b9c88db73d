use std::time::Duration;

use clap::Parser;
use log::info;

use ffm::header::FeedHeader;
use ffm::{codec, FeedReader, Frame, ReaderOptions, SeekMode};

#[derive(Parser)]
#[command(name = "ffm-info", about = "Parse and display FFM feed file structure")]
struct Args {
    /// Input .ffm file (optionally gzip-compressed)
    #[arg(short = 'f', long = "file")]
    file: Option<String>,

    /// Input .ffm file (positional)
    #[arg(conflicts_with = "file", required_unless_present_any = ["file", "schema", "version"])]
    input: Option<String>,

    /// Filter by stream index
    #[arg(short = 's', long = "stream")]
    stream_filter: Option<u8>,

    /// Start at this timestamp instead of the oldest packet
    #[arg(long)]
    seek: Option<i64>,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    limit: Option<u64>,

    /// Keep following a live feed, polling for new frames
    #[arg(long)]
    follow: bool,

    /// Reject unknown header tags instead of skipping them
    #[arg(long)]
    strict: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Print JSON schema for the output format and exit
    #[arg(long)]
    schema: bool,

    /// Display version and quit
    #[arg(long)]
    version: bool,
}

/// Top-level JSON output shape.
#[derive(serde::Serialize, schemars::JsonSchema)]
struct Dump {
    header: FeedHeader,
    frames: Vec<Frame>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Reset SIGPIPE to default so piped output (e.g. head/tail) exits cleanly
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.version {
        println!("ffm-info {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.schema {
        let schema = schemars::schema_for!(Dump);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let file = args.file.clone().or(args.input.clone()).expect("file argument required");
    let options = ReaderOptions { attached: args.follow, strict: args.strict };
    let mut reader = FeedReader::open_with(&file, options)?;

    if let Some(target) = args.seek {
        reader.seek(target, SeekMode::Earliest)?;
    }

    if args.json {
        let mut dump = Dump { header: reader.header().clone(), frames: Vec::new() };
        while let Some(frame) = next_frame(&mut reader, args.follow)? {
            if keep(&args, &frame) {
                dump.frames.push(frame);
                if at_limit(&args, dump.frames.len() as u64) {
                    break;
                }
            }
        }
        println!("{}", serde_json::to_string(&dump)?);
        return Ok(());
    }

    print_header(reader.header());
    println!(
        "{:>6} {:>4} {:>3} {:>12} {:>12} {:>6} {:>9}",
        "Stream", "Type", "KF", "DTS", "PTS", "DUR", "SIZE"
    );
    let mut shown = 0u64;
    while let Some(frame) = next_frame(&mut reader, args.follow)? {
        if !keep(&args, &frame) {
            continue;
        }
        let media = match reader.streams().get(frame.stream_index as usize) {
            Some(s) => match s.media_type {
                codec::MediaType::Video => "V",
                codec::MediaType::Audio => "A",
            },
            None => "?",
        };
        println!(
            "{:>6} {:>4} {:>3} {:>12} {:>12} {:>6} {:>9}",
            frame.stream_index,
            media,
            if frame.key_frame() { 1 } else { 0 },
            frame.dts,
            frame.pts,
            frame.duration,
            frame.payload.len(),
        );
        shown += 1;
        if at_limit(&args, shown) {
            break;
        }
    }

    Ok(())
}

/// One frame, blocking through `WouldBlock` when following a live feed.
fn next_frame(reader: &mut FeedReader, follow: bool) -> ffm::Result<Option<Frame>> {
    loop {
        match reader.read_next_frame() {
            Ok(frame) => return Ok(frame),
            Err(e) if follow && e.is_would_block() => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }
}

fn keep(args: &Args, frame: &Frame) -> bool {
    args.stream_filter.is_none_or(|s| s == frame.stream_index)
}

fn at_limit(args: &Args, shown: u64) -> bool {
    args.limit.is_some_and(|n| shown >= n)
}

fn print_header(header: &FeedHeader) {
    info!("feed write index: 0x{:X}", header.write_index);
    println!(
        "packet size {} bytes, aggregate bit rate {} b/s, {} stream(s)",
        header.packet_size,
        header.bit_rate,
        header.streams.len()
    );
    for (i, s) in header.streams.iter().enumerate() {
        let name = codec::codec_info(s.codec_id).map(|c| c.name).unwrap_or("?");
        match (&s.video, &s.audio) {
            (Some(v), _) => println!(
                "  stream {i}: video {name} {}x{} tb {}/{} gop {} pix {}",
                v.width,
                v.height,
                v.time_base.num,
                v.time_base.den,
                v.gop_size,
                codec::pixel_format_name(v.pixel_format).unwrap_or("?"),
            ),
            (_, Some(a)) => println!(
                "  stream {i}: audio {name} {} Hz, {} ch, frame size {}",
                a.sample_rate, a.channels, a.frame_size
            ),
            _ => println!("  stream {i}: {name}"),
        }
    }
}
