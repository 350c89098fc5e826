use beacon_server::{Server, ServerConfig};

/// Entry point for the Beacon process.
///
/// Loads `--flag=value` command-line arguments into a [`ServerConfig`],
/// builds the [`Server`] (binding the config store and preparing the
/// lock manager), and runs its accept loop. `Server::shutdown` stops the
/// accept loop without killing in-flight sessions; wiring it to
/// SIGINT/SIGTERM needs a signal-handling crate this workspace doesn't
/// otherwise pull in, so for now the OS default (process exit) applies.
fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = match ServerConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("beacon-server: {e}");
            eprintln!(
                "usage: beacon-server --port=<port> --db-path=<dir> [--redis-port=<port>] [--redis-host=<host>] [--discovery-port=<port>] [--log-file=<path>]"
            );
            std::process::exit(2);
        }
    };

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("beacon-server: failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        eprintln!("beacon-server: {e}");
        std::process::exit(1);
    }
}
