//! minpe CLI
//!
//! Command-line glue around the library: picks up machine code, builds the
//! image and writes it to disk, or inspects an existing image.

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use log::LevelFilter;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use minpe::pe::{consts, import_table_rva_after, ImageView};
use minpe::{ImageBuilder, ImageConfig, ImportTableBuilder};

/// 2 + (4 * 3) - 6, result left in rax
const SAMPLE_PROGRAM: [u8; 18] = [
    0xB8, 0x04, 0x00, 0x00, 0x00, // mov  eax, 4
    0x48, 0x6B, 0xC0, 0x03, // imul rax, rax, 3
    0x48, 0x83, 0xC0, 0x02, // add  rax, 2
    0x48, 0x83, 0xE8, 0x06, // sub  rax, 6
    0xC3, // ret
];

#[derive(Parser)]
#[command(name = "minpe")]
#[command(version)]
#[command(about = "Minimal Windows x64 PE executable writer", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// PE32+ executable
    Exe,
    /// Computed layout as JSON
    Layout,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an executable from pre-encoded x64 machine code
    Build(BuildArgs),

    /// Print the headers, sections and imports of a PE32+ image
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Output file path
    #[arg(short, long, default_value = "program.exe")]
    output: PathBuf,

    /// Raw machine code file (defaults to a small arithmetic sample)
    #[arg(long, conflicts_with = "code_hex")]
    code_file: Option<PathBuf>,

    /// Machine code as hex bytes, e.g. "B8 2A 00 00 00 C3"
    #[arg(long)]
    code_hex: Option<String>,

    /// DLL to import from
    #[arg(long, default_value = "kernel32.dll")]
    dll: String,

    /// Function to import
    #[arg(long, default_value = "ExitProcess")]
    function: String,

    /// RVA of the import section (default: first page after the code)
    #[arg(long, value_parser = parse_u32)]
    idata_rva: Option<u32>,

    /// Preferred load address
    #[arg(long, value_parser = parse_u64)]
    image_base: Option<u64>,

    /// JSON file with optional header settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// What to produce
    #[arg(long, value_enum, default_value = "exe")]
    emit: Emit,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_u64(s)?;
    u32::try_from(value).map_err(|_| format!("'{}' does not fit in 32 bits", s))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err("code must be hex digits".to_string());
    }
    if digits.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("invalid hex byte '{}': {}", &digits[i..i + 2], e))
        })
        .collect()
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn fail(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("{}: {}", "error".red().bold(), message);
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Build(args) => cmd_build(args),
        Commands::Inspect { file } => cmd_inspect(file),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ImageConfig, String> {
    let Some(path) = path else {
        return Ok(ImageConfig::default());
    };
    let text = fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid config '{}': {}", path.display(), e))
}

fn load_code(opts: &BuildArgs) -> Result<Vec<u8>, String> {
    if let Some(path) = &opts.code_file {
        return fs::read(path).map_err(|e| format!("could not read '{}': {}", path.display(), e));
    }
    if let Some(hex) = &opts.code_hex {
        return parse_hex_bytes(hex);
    }
    Ok(SAMPLE_PROGRAM.to_vec())
}

fn cmd_build(opts: BuildArgs) -> ExitCode {
    let mut config = match load_config(opts.config.as_ref()) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    if let Some(base) = opts.image_base {
        config.image_base = base;
    }

    let code = match load_code(&opts) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };

    let idata_rva = match opts.idata_rva {
        Some(rva) => rva,
        None => match import_table_rva_after(code.len(), &config) {
            Ok(rva) => rva,
            Err(e) => return fail(e),
        },
    };

    let table = match ImportTableBuilder::new(idata_rva)
        .import(&opts.dll, &opts.function)
        .build()
    {
        Ok(t) => t,
        Err(e) => return fail(e),
    };

    let builder = match ImageBuilder::for_executable(config, &code, idata_rva, table.bytes()) {
        Ok(b) => b,
        Err(e) => return fail(e),
    };

    match opts.emit {
        Emit::Layout => match builder.layout() {
            Ok(layout) => match serde_json::to_string_pretty(&layout) {
                Ok(json) => {
                    println!("{}", json);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(e),
            },
            Err(e) => fail(e),
        },
        Emit::Exe => {
            let image = match builder.build() {
                Ok(image) => image,
                Err(e) => return fail(e),
            };
            if let Err(e) = fs::write(&opts.output, &image) {
                return fail(format!("could not write '{}': {}", opts.output.display(), e));
            }
            println!(
                "{} {} ({} bytes of code, {} bytes total)",
                "Built".green().bold(),
                opts.output.display(),
                code.len(),
                image.len()
            );
            if let Some(slot) = table.iat_slot(&opts.dll, &opts.function) {
                println!(
                    "  {}!{} resolves through IAT slot {:#x}",
                    opts.dll, opts.function, slot
                );
            }
            ExitCode::SUCCESS
        }
    }
}

fn cmd_inspect(file: PathBuf) -> ExitCode {
    let data = match fs::read(&file) {
        Ok(d) => d,
        Err(e) => return fail(format!("could not read '{}': {}", file.display(), e)),
    };
    let view = match ImageView::parse(&data) {
        Ok(v) => v,
        Err(e) => return fail(e),
    };

    let opt = &view.optional;
    println!("{} {}", "Image".green().bold(), file.display());
    println!("  machine            {:#06x}", view.coff.machine);
    println!("  characteristics    {:#06x}", view.coff.characteristics);
    println!("  image base         {:#x}", opt.image_base);
    println!("  entry point        {:#x}", opt.address_of_entry_point);
    println!(
        "  alignment          section {:#x}, file {:#x}",
        opt.section_alignment, opt.file_alignment
    );
    println!(
        "  size               image {:#x}, headers {:#x}",
        opt.size_of_image, opt.size_of_headers
    );

    println!("{}", "Sections".cyan().bold());
    for s in &view.sections {
        println!(
            "  {:<8} rva {:#07x} vsize {:#07x}  file {:#07x} raw {:#07x}  {:#010x}",
            s.name_str(),
            s.virtual_address,
            s.virtual_size,
            s.pointer_to_raw_data,
            s.size_of_raw_data,
            s.characteristics
        );
    }

    let imports = match view.imports() {
        Ok(i) => i,
        Err(e) => return fail(e),
    };
    println!("{}", "Imports".cyan().bold());
    for dll in &imports {
        for (i, (hint, name)) in dll.functions.iter().enumerate() {
            let slot = dll.iat_rva + (i * consts::THUNK_SIZE) as u32;
            println!("  {}!{} (hint {}) IAT {:#x}", dll.dll, name, hint, slot);
        }
    }

    ExitCode::SUCCESS
}
