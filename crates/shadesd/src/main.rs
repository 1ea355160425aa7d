//! shadesd - The Shades Database Server Binary
//!
//! Initialization order follows the library's contract: process the
//! command line and parameter layers first, then create or recover the
//! database, then enter the virtual machine. The VM entry point checks
//! the `suspended_*` roots itself, so a database recovered mid-commit
//! resumes its suspended thread transparently.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration or I/O errors,
//! 2 on invariant violations (assertion failures).

use anyhow::Context;
use shades::{interp, Params, ShadesError, Vm, NULL_PTR};

const USAGE: &str = "\
usage: shadesd [options] [--<param>=<value>...]

options:
  --create            create a fresh database instead of recovering
  --verbose           verbose mode (same as --be_verbose=yes)
  --show-params       print every parameter with its value and exit
  --show-bcode-ids    announce bcode ids as routines are loaded
  --params-file=PATH  read parameters from PATH instead of the search path
  --help              this text

Any typed parameter may be set with --name=value; integer values accept
k/M/G suffixes and ^ exponentiation. Parameters are read from the first
parameter file found, then SHADES_* environment variables, then the
command line.";

fn main() {
    env_logger::init();
    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::error!("{e:#}");
            eprintln!("shadesd: {e:#}");
            match e.downcast_ref::<ShadesError>() {
                Some(se) => se.exit_code(),
                None => 1,
            }
        }
        // A panic is an invariant violation somewhere below us.
        Err(_) => 2,
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut params = Params::default();

    // Parameter layering: file, environment, command line.
    let params_file = args
        .iter()
        .find_map(|a| a.strip_prefix("--params-file="))
        .map(str::to_string);
    match &params_file {
        Some(path) => params
            .apply_file(path)
            .with_context(|| format!("parameter file {path}"))?,
        None => params.apply_first_param_file().context("parameter file")?,
    }
    params.apply_env().context("environment parameters")?;
    let rest = params
        .apply_cli(args.iter().map(String::as_str))
        .context("command line parameters")?;

    let mut create = false;
    let mut show_params = false;
    let mut show_bcode_ids = false;
    for arg in rest {
        match arg {
            "--create" => create = true,
            "--verbose" => params.be_verbose = true,
            "--show-params" => show_params = true,
            "--show-bcode-ids" => show_bcode_ids = true,
            "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            a if a.starts_with("--params-file=") => {}
            other => anyhow::bail!("unknown argument {other:?} (try --help)"),
        }
    }

    if show_params {
        print!("{}", params.show());
        return Ok(());
    }

    let mut heap = if create {
        let heap = shades::create_db(params)?;
        log::info!("created a fresh database");
        heap
    } else {
        match shades::recover_db(params.clone()) {
            Ok(heap) => heap,
            Err(ShadesError::NoValidRoot) => {
                log::warn!("no valid root block found; starting a fresh database");
                shades::create_db(params)?
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut vm = Vm::new();
    vm.show_bcode_ids = show_bcode_ids;
    vm.after_commit(&mut heap);

    // Run whatever the database holds: a thread suspended across the
    // last commit, queued contexts, or nothing at all.
    let accu = interp(&mut heap, &mut vm, NULL_PTR, 0, 1)?;
    log::info!("virtual machine returned accu {accu:#x}");

    heap.flush_batch()?;
    if heap.params().be_verbose {
        eprintln!("{}", heap.stats.summary());
    }
    Ok(())
}
