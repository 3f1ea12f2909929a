use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gridflow::math::vm;
use gridflow::ptdf::to_rows;
use gridflow::{
    continuation_pf, linear_analysis, n_minus_1, read_case, run_pf, Alg, CpfOptionsBuilder,
    CpfStopAt, NMinusOneResults, PowerFlowOptions, PowerFlowResults, QControl, SBus, SolverBackend, ZipInjection,
};
use num_complex::Complex64;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

/// Power flow, continuation power flow and linear sensitivity analysis.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Power Flow
    #[clap(name = "pf")]
    PowerFlow(PfArgs),

    /// Continuation Power Flow
    #[clap(name = "cpf")]
    CPF(CpfArgs),

    /// Power Transfer Distribution Factors
    #[clap(name = "ptdf")]
    PTDF(PtdfArgs),

    /// Line Outage Distribution Factors
    #[clap(name = "lodf")]
    LODF(LodfArgs),

    /// Single branch outage (N-1) screening on the DC network
    #[clap(name = "n1")]
    N1(LodfArgs),
}

#[derive(Args)]
struct CaseArgs {
    /// The input case (JSON).
    #[arg(required = true)]
    input: PathBuf,

    /// Output file. Results are written to stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Linear solver backend (sparse or dense).
    #[arg(long)]
    backend: Option<SolverBackend>,
}

#[derive(Args)]
struct PfArgs {
    #[command(flatten)]
    case: CaseArgs,

    /// Power flow algorithm (nr, gs, fdxb, fdbx or dc).
    #[arg(long)]
    alg: Option<Alg>,

    /// Termination tolerance on per unit P & Q mismatch.
    #[arg(long)]
    tol: Option<f64>,

    /// Maximum number of iterations.
    #[arg(long)]
    max_it: Option<usize>,

    /// Enforce gen reactive power limits at expense of |V|.
    #[arg(long, default_value_t = false)]
    qlim: bool,

    /// Share the slack power among buses by installed power.
    #[arg(long, default_value_t = false)]
    distributed_slack: bool,
}

#[derive(Args)]
struct PtdfArgs {
    #[command(flatten)]
    case: CaseArgs,

    /// Share the slack power among buses by installed power.
    #[arg(long, default_value_t = false)]
    distributed_slack: bool,
}

#[derive(Args)]
struct LodfArgs {
    #[command(flatten)]
    case: CaseArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum StopAt {
    Nose,
    Full,
    Overloads,
}

#[derive(Args)]
struct CpfArgs {
    #[command(flatten)]
    case: CaseArgs,

    /// Multiplier of the base case injections giving the target case.
    #[arg(long, required = true)]
    target_scale: f64,

    #[arg(long, value_enum, default_value_t = StopAt::Nose)]
    stop_at: StopAt,

    /// Stop once a bus voltage falls below this magnitude (p.u.).
    #[arg(long)]
    min_voltage: Option<f64>,

    /// Initial continuation step.
    #[arg(long)]
    step: Option<f64>,
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_level(false)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    match execute(&cli) {
        Ok(_) => {
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(2);
        }
    }
}

fn write_json<T: Serialize>(output: &Option<PathBuf>, value: &T) -> Result<()> {
    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    serde_json::to_writer_pretty(&mut writer, value)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct PfOutput<'a> {
    bus_ids: Vec<usize>,
    #[serde(flatten)]
    results: &'a PowerFlowResults,
    island_errors: Vec<String>,
}

#[derive(Serialize)]
struct N1Output<'a> {
    #[serde(flatten)]
    results: &'a NMinusOneResults,
    errors: Vec<String>,
}

#[derive(Serialize)]
struct LinearOutput {
    bus_ids: Vec<usize>,
    matrix: Vec<Vec<f64>>,
    /// Branches whose outage splits the network.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    islanding: Vec<usize>,
}

fn execute(cli: &Cli) -> Result<()> {
    let args = match &cli.command {
        Commands::PowerFlow(args) => &args.case,
        Commands::CPF(args) => &args.case,
        Commands::PTDF(args) => &args.case,
        Commands::LODF(args) => &args.case,
        Commands::N1(args) => &args.case,
    };

    let case = read_case(&args.input)?;
    let nc = case.to_circuit()?;
    let bus_ids = case.bus_ids();

    let mut opt = PowerFlowOptions::default();
    if let Some(backend) = args.backend {
        opt.backend = backend;
    }

    match &cli.command {
        Commands::PowerFlow(pf) => {
            if let Some(alg) = pf.alg {
                opt.alg = alg;
            }
            if let Some(tol) = pf.tol {
                opt.tolerance = tol;
            }
            if let Some(max_it) = pf.max_it {
                match opt.alg {
                    Alg::GS => opt.max_iter_gs = max_it,
                    _ => opt.max_iter = max_it,
                }
            }
            if pf.qlim {
                opt.control_q = QControl::Direct;
            }
            opt.distributed_slack = pf.distributed_slack;

            let res = run_pf(&nc, &opt)?;
            write_json(
                &args.output,
                &PfOutput {
                    bus_ids,
                    results: &res,
                    island_errors: res
                        .island_errors
                        .iter()
                        .map(|(i, err)| format!("island {}: {}", i, err))
                        .collect(),
                },
            )?;
            if !res.converged {
                bail!("power flow did not succeed");
            }
        }
        Commands::PTDF(ptdf) => {
            let la = linear_analysis(&nc, ptdf.distributed_slack, opt.backend)?;
            write_json(
                &args.output,
                &LinearOutput {
                    bus_ids,
                    matrix: to_rows(&la.ptdf),
                    islanding: la.lodf.islanding.clone(),
                },
            )?;
        }
        Commands::LODF(_) => {
            let la = linear_analysis(&nc, false, opt.backend)?;
            write_json(
                &args.output,
                &LinearOutput {
                    bus_ids,
                    matrix: to_rows(&la.lodf.lodf),
                    islanding: la.lodf.islanding.clone(),
                },
            )?;
        }
        Commands::N1(_) => {
            let slack = match nc.slack_buses().first() {
                Some(&slack) => slack,
                None => bail!("the case has no slack bus"),
            };
            let p: Vec<f64> = ZipInjection::from_circuit(&nc).s.iter().map(|s| s.re).collect();
            let outages: Vec<usize> = (0..nc.nbr()).collect();
            let res = n_minus_1(&nc, &p, slack, &outages, opt.backend.build().as_ref())?;
            write_json(
                &args.output,
                &N1Output {
                    results: &res,
                    errors: res
                        .errors
                        .iter()
                        .map(|(k, err)| format!("branch {}: {}", k, err))
                        .collect(),
                },
            )?;
        }
        Commands::CPF(cpf) => {
            let base = run_pf(&nc, &opt)?;
            if !base.converged {
                bail!("base case power flow did not converge");
            }
            let v0 = base.voltage;
            let s_base = ZipInjection::from_circuit(&nc).s_bus(&vm(&v0));
            let s_target: Vec<Complex64> = s_base.iter().map(|s| s * cpf.target_scale).collect();

            let stop_at = match (cpf.min_voltage, cpf.stop_at) {
                (Some(v), _) => CpfStopAt::MinVoltage(v),
                (None, StopAt::Nose) => CpfStopAt::Nose,
                (None, StopAt::Full) => CpfStopAt::Full,
                (None, StopAt::Overloads) => CpfStopAt::ExtraOverloads,
            };
            let mut builder = CpfOptionsBuilder::default();
            builder.stop_at(stop_at).backend(opt.backend);
            if let Some(step) = cpf.step {
                builder.step(step);
            }
            let cpf_opt = builder.build()?;

            let cancel = AtomicBool::new(false);
            let progress = |step: usize, lambda: f64| log::info!("step {}: lambda = {:.6}", step, lambda);
            let res = continuation_pf(&nc, &s_base, &s_target, &v0, &cpf_opt, Some(&progress), &cancel)?;
            write_json(&args.output, &res)?;
        }
    }

    Ok(())
}
