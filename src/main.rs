use tracing::{error, info_span};

use sluicedb::{init_settings, init_tracing, run_servers};


fn main() {
    let settings = match init_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("could not load config: {}", e);
            std::process::exit(1);
        },
    };
    init_tracing(&settings.log_level);

    let _span = info_span!("startup").entered();
    if let Err(e) = run_servers(settings) {
        error!(%e, "could not start sluicedb");
        std::process::exit(1);
    }
}
