//! fpga-bringup entry point

use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use fpga_bringup::sim::SimServer;
use fpga_bringup::xsdb_client::XsdbClient;
use fpga_bringup::{
    Args, Config, DebugServer, FailureKind, Sequencer, TargetRegistry, TransportHandle,
};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("Starting fpga-bringup v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            eprintln!("error: {}", e);
            return Ok(ExitCode::from(FailureKind::InvalidPlan.exit_code()));
        }
    };

    if args.show_config {
        println!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let server: Box<dyn DebugServer> = if args.simulate {
        info!("Using simulated hardware server");
        Box::new(SimServer::arty())
    } else {
        Box::new(XsdbClient::new(config.xsdb()))
    };

    if args.list_targets {
        return list_targets(server, &config, args.json).await;
    }

    let report = Sequencer::new(server, config.plan()).run().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        println!("{}", report);
    }
    Ok(ExitCode::from(report.exit_code()))
}

async fn list_targets(
    server: Box<dyn DebugServer>,
    config: &Config,
    json: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut transport = TransportHandle::new(server);

    match TargetRegistry::survey(&mut transport, &config.plan().connection).await {
        Ok(targets) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&targets)?);
            } else {
                for target in &targets {
                    println!("{}", target);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Listing targets failed: {}", e);
            eprintln!("error: {}", e);
            Ok(ExitCode::from(e.kind().exit_code()))
        }
    }
}

fn init_logging(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    debug!("Logging initialized with level: {}", args.log_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use fpga_bringup::config::Args;
    use fpga_bringup::ResetMode;

    #[test]
    fn test_args_parsing_defaults() {
        let args = Args::parse_from(["fpga-bringup"]);
        assert!(args.plan.is_none());
        assert!(args.url.is_none());
        assert!(!args.simulate);
        assert!(!args.list_targets);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_args_parsing_with_options() {
        let args = Args::parse_from([
            "fpga-bringup",
            "--url", "tcp:127.0.0.1:3121",
            "--logic-filter", "xc7a35t",
            "--hw", "DP168_bd_wrapper_2.xsa",
            "--bitstream", "DP168_bd_wrapper.bit",
            "--core-filter", "*Hart*",
            "--elf", "MPapp_component2.elf",
            "--reset-mode", "halt",
            "--xsdb-path", "/opt/Xilinx/Vitis/2024.1/bin/xsdb",
            "--json",
        ]);
        assert_eq!(args.url.unwrap(), "tcp:127.0.0.1:3121");
        assert_eq!(args.hardware_description.unwrap().to_str().unwrap(), "DP168_bd_wrapper_2.xsa");
        assert_eq!(args.core_filter.unwrap(), "*Hart*");
        assert_eq!(args.reset_mode, Some(ResetMode::Halt));
        assert!(args.xsdb_path.is_some());
        assert!(args.json);
    }

    #[test]
    fn test_args_reject_unknown_reset_mode() {
        assert!(Args::try_parse_from(["fpga-bringup", "--reset-mode", "sideways"]).is_err());
    }
}
