//! ipucc - command line driver for the codelet pipeline.
//!
//! Reads a file in the textual kernel format and checks, emits, builds or
//! emulates the codelets it defines. Set `RUST_LOG` for diagnostics.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use ipu_codelet::build::Toolchain;
use ipu_codelet::emulator::FieldData;
use ipu_codelet::kernel::{FieldShape, Scalar};
use ipu_codelet::{
    define_codelet, generate, parse_codelets, BuildConfig, Codelet, CodeletError, CodeletResult, CodegenOptions,
    ElemType, Emulator, Orchestrator, TargetDesc,
};

#[derive(Parser)]
#[command(name = "ipucc")]
#[command(author, version, about = "Compile IPU codelets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and verify every codelet of a file
    Check {
        file: PathBuf,
    },

    /// Print generated code for one codelet
    Emit {
        file: PathBuf,
        /// Codelet to emit; defaults to the only one in the file
        #[arg(long)]
        codelet: Option<String>,
        #[arg(long, value_enum, default_value_t = Emit::Ll)]
        what: Emit,
        #[arg(long, default_value = "ipu21")]
        target: String,
        #[arg(long)]
        disable_print: bool,
    },

    /// Build every codelet of a file with the toolchain
    Build {
        file: PathBuf,
        /// Directory receiving the graph program objects
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, default_value = "ipu21")]
        target: String,
        #[arg(long, default_value = "popc")]
        toolchain: PathBuf,
        #[arg(long)]
        keep_files: bool,
        #[arg(long)]
        no_progress: bool,
        #[arg(long)]
        disable_print: bool,
        /// Extra flag passed to the toolchain (repeatable)
        #[arg(long = "extra-flag", allow_hyphen_values = true)]
        extra_flags: Vec<String>,
    },

    /// Run one codelet on the host emulator
    Run {
        file: PathBuf,
        #[arg(long)]
        codelet: Option<String>,
        /// Field contents as `name=v1,v2,...` (repeatable)
        #[arg(long = "set")]
        values: Vec<String>,
        /// Tile the vertex runs on; seeds the random generator
        #[arg(long, default_value_t = 0)]
        tile: u32,
        #[arg(long)]
        disable_print: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Emit {
    /// LLVM IR module
    Ll,
    /// C++ vertex declaration
    Cpp,
    /// Canonical kernel text
    Kir,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            if let CodeletError::Verification(err) = &e {
                for violation in err.violations() {
                    eprintln!("  {}", violation);
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> CodeletResult<()> {
    match command {
        Commands::Check { file } => {
            for codelet in load(&file)? {
                println!("{}", codelet);
            }
            Ok(())
        }
        Commands::Emit {
            file,
            codelet,
            what,
            target,
            disable_print,
        } => {
            let codelet = select(load(&file)?, codelet.as_deref())?;
            let target = parse_target(&target)?;
            match what {
                Emit::Kir => print!("{}", codelet.spec()),
                Emit::Ll | Emit::Cpp => {
                    let options = CodegenOptions { print: !disable_print };
                    let artifact = generate(&codelet, &target, &options)?;
                    match what {
                        Emit::Ll => print!("{}", artifact.module),
                        _ => print!("{}", artifact.vertex_declaration),
                    }
                }
            }
            Ok(())
        }
        Commands::Build {
            file,
            out_dir,
            target,
            toolchain,
            keep_files,
            no_progress,
            disable_print,
            extra_flags,
        } => {
            let target = parse_target(&target)?;
            let mut config = BuildConfig::process().clone();
            config.keep_files |= keep_files;
            config.disable_print |= disable_print;
            config.progress &= !no_progress;
            config.extra_flags.extend(extra_flags);

            let orchestrator = Orchestrator::new(config).with_toolchain(Toolchain::new(toolchain));
            fs::create_dir_all(&out_dir)?;
            for codelet in load(&file)? {
                let built = orchestrator.build(&codelet, &target)?;
                let path = out_dir.join(format!("{}.gp", codelet.name()));
                fs::write(&path, &built.object)?;
                println!("{} -> {}", codelet, path.display());
                if let Some(dir) = &built.kept_dir {
                    println!("  build files kept in {}", dir.display());
                }
            }
            Ok(())
        }
        Commands::Run {
            file,
            codelet,
            values,
            tile,
            disable_print,
        } => {
            let codelet = select(load(&file)?, codelet.as_deref())?;
            let mut data = field_data(&codelet, &values)?;
            let mut emulator = Emulator::new(tile).print(!disable_print);
            emulator.run(&codelet, &mut data)?;

            print!("{}", emulator.output());
            for field in codelet.fields().iter().filter(|f| f.direction.is_writable()) {
                let values: Vec<String> = data
                    .get(&field.name)
                    .map(|v| v.iter().map(|s| format_scalar(*s)).collect())
                    .unwrap_or_default();
                println!("{} = [{}]", field.name, values.join(", "));
            }
            Ok(())
        }
    }
}

fn load(file: &Path) -> CodeletResult<Vec<Codelet>> {
    let text = fs::read_to_string(file)?;
    let specs = parse_codelets(&text)?;
    let mut codelets = Vec::with_capacity(specs.len());
    for spec in specs {
        codelets.push(define_codelet(spec)?);
    }
    Ok(codelets)
}

fn select(mut codelets: Vec<Codelet>, name: Option<&str>) -> CodeletResult<Codelet> {
    match name {
        Some(name) => codelets
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| CodeletError::CodeletNotFound { name: name.to_string() }),
        None if codelets.len() == 1 => Ok(codelets.remove(0)),
        None => {
            let names: Vec<&str> = codelets.iter().map(|c| c.name()).collect();
            Err(invalid(format!("pick a codelet with --codelet: {}", names.join(", "))))
        }
    }
}

fn parse_target(name: &str) -> CodeletResult<TargetDesc> {
    TargetDesc::from_name(name).ok_or_else(|| invalid(format!("unknown target `{}`", name)))
}

/// Field contents from `name=v1,v2` arguments; unset fields are zero-filled.
fn field_data(codelet: &Codelet, values: &[String]) -> CodeletResult<FieldData> {
    let mut data = FieldData::new();
    for arg in values {
        let (name, list) = arg.split_once('=').ok_or_else(|| invalid(format!("expected name=values, got `{}`", arg)))?;
        let field = codelet
            .fields()
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| invalid(format!("`{}` has no field `{}`", codelet.name(), name)))?;
        let parsed = list
            .split(',')
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_scalar(field.elem, v.trim()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid(format!("bad {} value in `{}`", field.elem, arg)))?;
        data.insert(field.name.clone(), parsed);
    }
    for field in codelet.fields() {
        if !data.contains_key(&field.name) {
            let len = match field.shape {
                FieldShape::Scalar => 1,
                FieldShape::Vector => 0,
            };
            data.insert(field.name.clone(), vec![Scalar::zero(field.elem); len]);
        }
    }
    Ok(data)
}

fn parse_scalar(elem: ElemType, text: &str) -> Option<Scalar> {
    Some(match elem {
        ElemType::Bool => Scalar::Bool(match text {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => return None,
        }),
        ElemType::I32 => Scalar::I32(text.parse().ok()?),
        ElemType::U32 => Scalar::U32(text.parse().ok()?),
        ElemType::I64 => Scalar::I64(text.parse().ok()?),
        ElemType::U64 => Scalar::U64(text.parse().ok()?),
        ElemType::F32 => Scalar::F32(text.parse().ok()?),
    })
}

fn format_scalar(value: Scalar) -> String {
    match value {
        Scalar::Bool(b) => b.to_string(),
        Scalar::I32(v) => v.to_string(),
        Scalar::U32(v) => v.to_string(),
        Scalar::I64(v) => v.to_string(),
        Scalar::U64(v) => v.to_string(),
        Scalar::F32(v) => v.to_string(),
    }
}

fn invalid(message: String) -> CodeletError {
    CodeletError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, message))
}
