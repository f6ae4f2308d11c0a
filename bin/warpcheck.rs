use std::io::{BufWriter, Write};

use clap::{Parser, ValueEnum};
use warpcheck::driver::Driver;
use warpcheck::{demos, ir::FuncId};

/// Runs the uncoalesced-access and block-size-invariance analyses over one
/// of the built-in demo kernels (there is no text IR format to parse a
/// kernel from — see `ir.rs`).
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Which demo kernel to analyze. Pass `--list` to see the available
    /// names.
    kernel: Option<String>,

    #[arg(long)]
    list: bool,

    #[arg(long, value_enum, default_value = "both")]
    analysis: AnalysisKindArg,

    /// Only print functions nothing in the program calls directly.
    #[arg(long, default_value_t = true)]
    entrypoints_only: bool,

    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormatArg,
}

#[derive(Clone, Copy, ValueEnum, PartialEq, Eq)]
enum AnalysisKindArg {
    Uncoalesced,
    Bsize,
    Both,
}

#[derive(Clone, Copy, ValueEnum, PartialEq, Eq)]
enum OutputFormatArg {
    Text,
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    if args.list || args.kernel.is_none() {
        println!("available kernels:");
        for name in demos::NAMES {
            println!("  {name}");
        }
        if args.kernel.is_none() {
            std::process::exit(1);
        }
        return;
    }

    let kernel_name = args.kernel.unwrap();
    let program = demos::named(&kernel_name).unwrap_or_else(|| {
        panic!("unknown kernel {kernel_name:?}; pass --list to see available kernels")
    });

    let driver = Driver::new().report_entrypoints_only(args.entrypoints_only);
    let reports = driver.run(&program);
    let reportable = driver.reportable(&program);

    let mut w = BufWriter::new(std::io::stdout());
    match args.format {
        OutputFormatArg::Text => write_text(&mut w, &reports, &reportable, args.analysis),
        OutputFormatArg::Json => write_json(&mut w, &reports, &reportable, args.analysis),
    }
}

fn write_text(
    w: &mut impl Write,
    reports: &std::collections::BTreeMap<FuncId, warpcheck::driver::FunctionReport>,
    reportable: &std::collections::BTreeSet<FuncId>,
    analysis: AnalysisKindArg,
) {
    for (func_id, report) in reports {
        if !reportable.contains(func_id) {
            continue;
        }
        writeln!(w, "{func_id}:").unwrap();
        if analysis != AnalysisKindArg::Bsize {
            writeln!(w, "  uncoalesced accesses: {}", report.uncoalesced.len()).unwrap();
            for point in &report.uncoalesced {
                writeln!(w, "    {}:{}", point.block, point.idx).unwrap();
            }
        }
        if analysis != AnalysisKindArg::Uncoalesced {
            writeln!(
                w,
                "  block-size-dependent accesses: {}",
                report.block_size_dependent.len()
            )
            .unwrap();
            for point in &report.block_size_dependent {
                writeln!(w, "    {}:{}", point.block, point.idx).unwrap();
            }
            writeln!(w, "  __syncthreads() calls: {}", report.sync_threads.len()).unwrap();
        }
        writeln!(w).unwrap();
    }
    w.flush().unwrap();
}

fn write_json(
    w: &mut impl Write,
    reports: &std::collections::BTreeMap<FuncId, warpcheck::driver::FunctionReport>,
    reportable: &std::collections::BTreeSet<FuncId>,
    analysis: AnalysisKindArg,
) {
    let mut functions = serde_json::Map::new();
    for (func_id, report) in reports {
        if !reportable.contains(func_id) {
            continue;
        }
        let point_list = |points: &std::collections::BTreeSet<warpcheck::engine::InstPoint>| {
            points
                .iter()
                .map(|p| serde_json::json!({"block": p.block.0, "idx": p.idx}))
                .collect::<Vec<_>>()
        };
        let mut entry = serde_json::Map::new();
        if analysis != AnalysisKindArg::Bsize {
            entry.insert(
                "uncoalesced_accesses".into(),
                serde_json::Value::Array(point_list(&report.uncoalesced)),
            );
        }
        if analysis != AnalysisKindArg::Uncoalesced {
            entry.insert(
                "block_size_dependent_accesses".into(),
                serde_json::Value::Array(point_list(&report.block_size_dependent)),
            );
            entry.insert(
                "sync_threads_calls".into(),
                serde_json::Value::Number(report.sync_threads.len().into()),
            );
        }
        functions.insert(func_id.0.clone(), serde_json::Value::Object(entry));
    }
    let out = serde_json::Value::Object(functions);
    writeln!(w, "{}", serde_json::to_string_pretty(&out).unwrap()).unwrap();
    w.flush().unwrap();
}
