fn main() {
    use clap::Parser;
    use std::error::Error;
    let args = fictionpack::cli::Args::parse();
    if let Err(e) = fictionpack::logging::init(args.verbose, args.quiet) {
        eprintln!("{:#}", e);
    }
    match fictionpack::cli::run(&args) {
        Ok(outcome) => std::process::exit(fictionpack::cli::outcome_exit_code(&outcome)),
        Err(e) => {
            eprintln!("{}", e);
            if args.verbose {
                let mut source = e.source();
                while let Some(s) = source {
                    eprintln!("  cause: {}", s);
                    source = s.source();
                }
            }
            std::process::exit(e.exit_code());
        }
    }
}
