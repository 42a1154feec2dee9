//! vonbus - CLI Entry Point
//!
//! Commands:
//! - `vonbus run <program>` - Run an assembly file or wire image
//! - `vonbus asm <source>` - Assemble to a wire image
//! - `vonbus disasm <image>` - Disassemble a wire image
//! - `vonbus monitor <program>` - Interactive terminal monitor
//! - `vonbus test` - Built-in self-test

use std::time::Duration;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use vonbus::{Machine, MachineConfig, MachineError, MachineSnapshot, WordLength};
use vonbus::machine::DEFAULT_MAX_STEPS;

#[derive(Parser)]
#[command(name = "vonbus")]
#[command(author = "Yigit")]
#[command(version = "0.1.0")]
#[command(about = "A Von Neumann machine emulator with a lane-multiplexed, bandwidth-limited bus")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// JSON machine configuration
    #[arg(long, global = true)]
    config: Option<String>,

    /// Register names, comma separated (e.g. A,B,C)
    #[arg(long, global = true, value_delimiter = ',')]
    registers: Option<Vec<String>>,

    /// Word length in bits: 16, 32 or 64
    #[arg(long, global = true)]
    word: Option<u32>,

    /// Bytes per lane per bus tick
    #[arg(long, global = true)]
    bus_width: Option<usize>,

    /// Memory size in bytes
    #[arg(long, global = true)]
    memory: Option<usize>,

    /// Bus clock in Hz
    #[arg(long, global = true)]
    frequency: Option<u32>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program until the machine goes idle
    Run {
        /// Path to the .asm source or .json wire image
        program: String,
        /// Maximum number of deterministic steps
        #[arg(short, long, default_value_t = DEFAULT_MAX_STEPS)]
        max_ticks: u64,
        /// Run each component on its own thread instead
        #[arg(short, long)]
        threaded: bool,
        /// Wall-clock seconds to run with --threaded
        #[arg(short, long, default_value = "1.0")]
        seconds: f64,
        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Assemble source to a wire image
    Asm {
        /// Path to the source file
        source: String,
        /// Output wire image
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Disassemble a wire image to readable text
    Disasm {
        /// Path to the wire image
        image: String,
    },
    /// Interactive terminal monitor
    Monitor {
        /// Path to the .asm source or .json wire image
        program: String,
    },
    /// Run the built-in self-test
    Test,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("failed to install logger: {}", e);
    }

    let config = match machine_config(&cli) {
        Ok(config) => config,
        Err(e) => fail(e),
    };

    let result = match cli.command {
        Some(Commands::Run { program, max_ticks, threaded, seconds, json }) => {
            run_program(config, &program, max_ticks, threaded, seconds, json)
        }
        Some(Commands::Asm { source, output }) => assemble_file(config, &source, output),
        Some(Commands::Disasm { image }) => disassemble_file(&config, &image),
        Some(Commands::Monitor { program }) => monitor_program(config, &program),
        Some(Commands::Test) => {
            run_self_test();
            Ok(())
        }
        None => {
            println!("vonbus v0.1.0");
            println!("A Von Neumann machine emulator with a bandwidth-limited bus");
            println!();
            println!("Use --help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        fail(e);
    }
}

fn fail(e: MachineError) -> ! {
    log::error!("{}", e);
    eprintln!("❌ {}", e);
    std::process::exit(1);
}

/// Config file first, then flag overrides.
fn machine_config(cli: &Cli) -> Result<MachineConfig, MachineError> {
    let mut config = match &cli.config {
        Some(path) => MachineConfig::load(path)?,
        None => MachineConfig::default(),
    };

    if let Some(registers) = &cli.registers {
        config.registers = registers.iter().map(|r| r.trim().to_string()).collect();
    }
    if let Some(bits) = cli.word {
        config.word_length = WordLength::try_from(bits)
            .map_err(|e| vonbus::ConfigError::Parse(e.to_string()))?;
    }
    if let Some(width) = cli.bus_width {
        config.bus_width = width;
    }
    if let Some(size) = cli.memory {
        config.memory_size = size;
    }
    if let Some(frequency) = cli.frequency {
        config.frequency = frequency;
    }

    config.validate()?;
    Ok(config)
}

fn run_program(
    config: MachineConfig,
    path: &str,
    max_ticks: u64,
    threaded: bool,
    seconds: f64,
    json: bool,
) -> Result<(), MachineError> {
    let mut machine = Machine::new(config)?;
    let program = machine.load_file(path)?;

    if program.is_empty() {
        return Err(MachineError::IoError(format!("{}: no instructions to execute", path)));
    }
    if !json {
        println!("🔧 Running: {} ({} instructions)", path, program.len());
    }

    let machine = if threaded {
        let running = machine.spawn();
        std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
        running.stop()?
    } else {
        machine.run_until_idle(max_ticks)?;
        machine
    };

    let snapshot = machine.snapshot();
    if json {
        let text = serde_json::to_string_pretty(&snapshot).map_err(|e| MachineError::IoError(e.to_string()))?;
        println!("{}", text);
        return Ok(());
    }

    print_snapshot(&snapshot);
    if !threaded && !snapshot.idle {
        println!();
        println!("⚠️  Reached max ticks limit ({}). Use --max-ticks to increase.", max_ticks);
    }
    Ok(())
}

fn print_snapshot(snapshot: &MachineSnapshot) {
    println!();
    println!("━━━ Result ━━━");
    println!("Steps:    {}", snapshot.steps);
    println!("Executed: {}", snapshot.executed);
    println!("Loop:     {}", snapshot.loop_state);
    println!();
    for (name, value) in &snapshot.registers {
        println!("{:>4}: {}", name, value);
    }
    if !snapshot.data.is_empty() {
        println!();
        for (address, value) in &snapshot.data {
            println!("0x{:03x}: {}", address, value);
        }
    }
    if !snapshot.cache.is_empty() {
        println!();
        for (address, entry) in &snapshot.cache {
            println!("0x{:03x}: {} (cached, {} accesses)", address, entry.value, entry.access);
        }
    }
    println!();
    println!(
        "Bus: {} ticks, {} fragments delivered, {} deferrals, {} in flight",
        snapshot.bus.ticks, snapshot.bus.delivered_fragments, snapshot.bus.deferrals, snapshot.bus.in_flight
    );
}

fn assemble_file(config: MachineConfig, source_path: &str, output: Option<String>) -> Result<(), MachineError> {
    let out_path = output.unwrap_or_else(|| source_path.replace(".asm", ".json"));
    println!("📝 Assembling: {} → {}", source_path, out_path);

    let source = std::fs::read_to_string(source_path).map_err(|e| MachineError::IoError(e.to_string()))?;
    let machine = Machine::new(config)?;
    let program = machine.assemble(&source)?;
    println!("✓ Assembled {} instructions ({} fragments)", program.len(), program.fragment_count());

    vonbus::save_image(&out_path, &program)?;
    println!("✓ Saved to {}", out_path);
    Ok(())
}

fn disassemble_file(config: &MachineConfig, image_path: &str) -> Result<(), MachineError> {
    println!("📖 Disassembling: {}", image_path);
    println!();

    let program = vonbus::load_image(image_path)?;
    let output = vonbus::disassemble(&program, &config.registers)?;
    println!("{}", output);
    Ok(())
}

#[cfg(feature = "tui")]
fn monitor_program(config: MachineConfig, path: &str) -> Result<(), MachineError> {
    let program = {
        let mut machine = Machine::new(config.clone())?;
        machine.load_file(path)?
    };
    println!("🚀 Launching monitor...");
    vonbus::run_monitor(config, program)
}

#[cfg(not(feature = "tui"))]
fn monitor_program(_config: MachineConfig, _path: &str) -> Result<(), MachineError> {
    Err(MachineError::IoError("built without the tui feature".into()))
}

fn run_self_test() {
    println!("━━━ vonbus Self-Test ━━━");
    println!();

    let cases: [(&str, &str, &[(&str, i64)], &[(i64, i64)]); 5] = [
        ("Register arithmetic", "mov A, 5; add A, 3", &[("A", 8), ("B", 0)], &[]),
        ("Counting loop", "label 0; inc A; A < 3 : JMP 0 : NULL", &[("A", 3)], &[]),
        ("Memory round trip", "mov 0x10, 7; mov A, 0x10", &[("A", 7)], &[(0x10, 7)]),
        ("Word wrap", "mov A, 32767; inc A", &[("A", -32768)], &[]),
        (
            "Loop cache write-back",
            "mov 0x10, 0; label 0; inc 0x10; inc A; A < 6 : JMP 0 : NULL",
            &[("A", 6)],
            &[(0x10, 6)],
        ),
    ];

    let mut passed = 0;
    let mut failed = 0;

    for (name, source, registers, data) in cases {
        print!("{}... ", name);
        let config = MachineConfig {
            registers: vec!["A".into(), "B".into()],
            ..MachineConfig::default()
        };
        let outcome = Machine::new(config).and_then(|mut machine| {
            machine.load_source(source)?;
            machine.run_until_idle(DEFAULT_MAX_STEPS)?;
            Ok(machine.snapshot())
        });

        match outcome {
            Ok(snapshot) => {
                let mismatch = registers
                    .iter()
                    .map(|(r, want)| (r.to_string(), snapshot.register(r).unwrap_or_default(), *want))
                    .chain(data.iter().map(|(a, want)| (format!("0x{:x}", a), snapshot.data_at(*a), *want)))
                    .find(|(_, got, want)| got != want);
                match mismatch {
                    None if snapshot.idle => {
                        println!("✓");
                        passed += 1;
                    }
                    None => {
                        println!("✗ (did not go idle)");
                        failed += 1;
                    }
                    Some((what, got, want)) => {
                        println!("✗ ({} = {}, expected {})", what, got, want);
                        failed += 1;
                    }
                }
            }
            Err(e) => {
                println!("✗ ({})", e);
                failed += 1;
            }
        }
    }

    println!();
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Results: {} passed, {} failed", passed, failed);

    if failed == 0 {
        println!("✓ All tests passed!");
    } else {
        std::process::exit(1);
    }
}
