//! Unified State Codec CLI
//!
//! Commands:
//!   encode - Encode a line-oriented file into a .usc container
//!   decode - Restore the original bytes from a container
//!   bench  - Measure ratio and throughput on a file or synthetic stream
//!   verify - Assert the lossless round-trip on a file
//!
//! Exit codes: 0 success, 1 malformed input, 2 unsupported version or mode,
//! 3 I/O error.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use usc::{bench, split_lines, CodecConfig, CodecError, Mode};

#[derive(Parser)]
#[command(name = "usc")]
#[command(about = "Unified State Codec - template-mined lossless log compression", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file into a container
    Encode {
        /// stream | hot-lite-full | cold
        #[arg(long, default_value = "stream")]
        mode: String,
        #[arg(long = "in")]
        input: String,
        #[arg(long = "out")]
        output: String,
        /// Lines per DATA packet (also via USC_WINDOW)
        #[arg(long)]
        window: Option<u32>,
        /// Template cap (also via USC_MAX_TEMPLATES)
        #[arg(long)]
        max_templates: Option<u32>,
        /// Disable the canonicalizer
        #[arg(long, default_value_t = false)]
        no_canon: bool,
    },
    /// Decode a container back to the original bytes
    Decode {
        #[arg(long = "in")]
        input: String,
        #[arg(long = "out")]
        output: String,
    },
    /// Benchmark encode on a file or a synthetic stream
    Bench {
        #[arg(long, default_value = "cold")]
        mode: String,
        /// Input file; omit to use a synthetic stream
        #[arg(long = "in")]
        input: Option<String>,
        /// Synthetic stream length in lines
        #[arg(long)]
        lines: Option<usize>,
        /// Emit the result as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Verify the lossless round-trip on a file
    Verify {
        #[arg(long, default_value = "stream")]
        mode: String,
        #[arg(long = "in")]
        input: String,
    },
}

fn parse_mode(s: &str) -> Result<Mode> {
    s.parse::<Mode>().map_err(|e| anyhow!(e))
}

fn read_input(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(CodecError::from)
        .with_context(|| format!("reading {path}"))
}

fn write_output(path: &str, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(CodecError::from)
        .with_context(|| format!("writing {path}"))
}

fn synthetic_lines(n: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let line = match i % 5 {
            0 => format!(
                "1700{:06} INFO dfs.DataNode: Receiving block blk_{} src 10.0.{}.{}\n",
                i % 1_000_000,
                4_000_000_000u64 + i as u64,
                i % 200,
                (i * 7) % 250
            ),
            1 => format!("1700{:06} WARN scheduler: queue depth {}\n", i % 1_000_000, i % 900),
            2 => format!(
                "1700{:06} INFO auth: session {:08x} user u{}\n",
                i % 1_000_000,
                (i as u64).wrapping_mul(2_654_435_761),
                i % 31
            ),
            3 => format!("1700{:06} INFO dfs.DataNode: verified blk_{}\n", i % 1_000_000, 4_000_000_000u64 + i as u64),
            _ => "heartbeat ok\n".to_string(),
        };
        out.push(line.into_bytes());
    }
    out
}

fn run(cli: Cli) -> Result<()> {
    match cli.cmd {
        Commands::Encode {
            mode,
            input,
            output,
            window,
            max_templates,
            no_canon,
        } => {
            let mut cfg = CodecConfig::for_mode(parse_mode(&mode)?).apply_env();
            if let Some(w) = window {
                cfg.window_size = w;
            }
            if let Some(m) = max_templates {
                cfg.max_templates = m;
            }
            cfg.canonicalize = !no_canon;

            let bytes = read_input(&input)?;
            let lines = split_lines(&bytes);
            let encoded = usc::encode_lines(&lines, &cfg)?;
            write_output(&output, &encoded.container)?;

            let stats = &encoded.stats;
            println!("Encoded {} lines ({} bytes) -> {} bytes", stats.lines, bytes.len(), stats.container_bytes);
            println!("  Templates:      {:>10}", stats.templates);
            println!("  Templated rows: {:>10}", stats.templated_rows);
            println!("  Raw rows:       {:>10}", stats.raw_rows);
            println!("  DICT bytes:     {:>10}", stats.dict_bytes);
            println!("  DATA packets:   {:>10}", stats.data_bytes.len());
            Ok(())
        }

        Commands::Decode { input, output } => {
            let bytes = read_input(&input)?;
            let decoded = usc::decode_container(&bytes)?;
            let restored = usc::join_lines(&decoded.lines);
            write_output(&output, &restored)?;
            println!("Decoded {} lines ({} bytes) to {}", decoded.lines.len(), restored.len(), output);
            Ok(())
        }

        Commands::Bench { mode, input, lines, json } => {
            let cfg = CodecConfig::for_mode(parse_mode(&mode)?).apply_env();
            let line_data = match (&input, lines) {
                (Some(path), _) => split_lines(&read_input(path)?),
                (None, Some(n)) => synthetic_lines(n),
                (None, None) => return Err(anyhow!("bench needs --in <path> or --lines N")),
            };

            let r = bench::bench_encode(&line_data, &cfg)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&r)?);
            } else {
                println!("=== BENCH RESULTS ===");
                println!("Input bytes:     {:>12}", r.input_bytes);
                println!("Lines:           {:>12}", r.lines);
                println!("Templates:       {:>12}", r.templates);
                println!("Templated rows:  {:>12}", r.templated_rows);
                println!("Raw rows:        {:>12}", r.raw_rows);
                println!("DICT bytes:      {:>12}", r.dict_bytes);
                println!("DATA bytes:      {:>12}", r.data_bytes_total);
                println!("Container bytes: {:>12}", r.container_bytes);
                println!("Time:            {:>12.4} s", r.seconds);
                println!("Throughput:      {:>12.0} lines/s", r.lines_per_sec);
                println!("Ratio:           {:>12.2}x", r.compression_ratio);
            }

            let log = bench::verify_lossless(&line_data, &cfg)?;
            println!("Lossless verified over {} lines", log.len());
            Ok(())
        }

        Commands::Verify { mode, input } => {
            let cfg = CodecConfig::for_mode(parse_mode(&mode)?).apply_env();
            let lines = split_lines(&read_input(&input)?);
            match bench::verify_lossless(&lines, &cfg) {
                Ok(log) => {
                    println!("OK: decode(encode(input)) == input ({} lines)", log.len());
                    Ok(())
                }
                Err(e) => {
                    println!("FAIL: {e}");
                    Err(e.into())
                }
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        let code = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<CodecError>().map(CodecError::exit_code))
            .unwrap_or(1);
        std::process::exit(code);
    }
}
