use anyhow::Context;
use infomap::{Infomap, Network};
use std::process::ExitCode;
use std::time::{Instant, SystemTime};

fn run() -> anyhow::Result<()> {
    let cfg = match infomap::cli::parse_args(std::env::args_os()) {
        Ok(cfg) => cfg,
        Err(e) => e.exit(),
    };
    infomap::logger::init_logger(cfg.verbosity);

    let start_system = SystemTime::now();
    let start = Instant::now();

    let network = Network::from_file(&cfg.network_file)
        .with_context(|| format!("Can't read network '{}'", cfg.network_file.display()))?;
    let mut infomap = Infomap::new(cfg.clone(), &network).context("Can't set up the network")?;
    let stats = infomap.run();

    let elapsed = start.elapsed();
    let written = infomap::output::write_outputs(&cfg, &infomap, start_system, elapsed);

    if !cfg.silent {
        println!(
            "Partitioned into {} top modules, codelength {:.6} ({:.2}% compression over {:.6})",
            infomap.num_top_modules(),
            infomap.hierarchical_codelength(),
            stats.compression() * 100.0,
            stats.one_level_codelength
        );
    }

    written.context("Can't write output files")?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
