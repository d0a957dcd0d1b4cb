use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pagination_loadtest::client::{build_client, ClientConfig};
use pagination_loadtest::config::TestPlan;
use pagination_loadtest::metrics::{register_metrics, start_metrics_server};
use pagination_loadtest::runner::{RunError, EXIT_CONFIG};

/// Prints helpful configuration documentation.
fn print_usage() {
    eprintln!("Usage: pagination_loadtest <plan.yaml>");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  CONFIG_FILE             - Path to the YAML test plan (overrides the argument)");
    eprintln!("  RUST_LOG                - Log filter (default: info)");
    eprintln!("  LOG_FORMAT              - 'json' for JSON log lines (default: text)");
    eprintln!("  METRICS_PORT            - Serve Prometheus metrics on this port (default: off)");
    eprintln!();
    eprintln!("Exit codes: 0 all thresholds passed, 1 threshold failed or indeterminate,");
    eprintln!("            2 configuration error");
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    if env::var("LOG_FORMAT").map(|f| f.eq_ignore_ascii_case("json")).unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn exit_on_setup_error(e: RunError) -> ! {
    eprintln!("Setup error: {}", e);
    std::process::exit(e.exit_code());
}

#[tokio::main]
async fn main() {
    init_logging();

    let Some(path) = env::var("CONFIG_FILE").ok().or_else(|| env::args().nth(1)) else {
        print_usage();
        std::process::exit(EXIT_CONFIG);
    };

    let test = match TestPlan::from_file(&path).and_then(|plan| plan.to_load_test()) {
        Ok(test) => test,
        Err(e) => {
            eprintln!("Configuration error in {}: {}\n", path, e);
            print_usage();
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Ok(port) = env::var("METRICS_PORT") {
        let port: u16 = match port.parse() {
            Ok(port) => port,
            Err(e) => {
                eprintln!("Configuration error: METRICS_PORT '{}': {}", port, e);
                std::process::exit(EXIT_CONFIG);
            }
        };
        let registry = prometheus::default_registry().clone();
        if let Err(e) = register_metrics(&registry) {
            exit_on_setup_error(e.into());
        }
        tokio::spawn(start_metrics_server(port, registry));
    }

    let client = match build_client(&ClientConfig::default().with_timeout(test.request_timeout)) {
        Ok(client) => client,
        Err(e) => exit_on_setup_error(e.into()),
    };

    info!(plan = %path, name = %test.display_name(), "Test plan loaded");

    let report = match test.run(Arc::new(client)).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Load test did not start");
            std::process::exit(e.exit_code());
        }
    };

    println!("{}", report.summary);
    std::process::exit(report.exit_code());
}
