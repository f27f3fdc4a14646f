use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use workshop_chain::{
    ChainConfig, ChainError, EventBus, LoggingObserver, ShutdownPolicy, Supervisor, WorkshopId,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Drain,
    Abort,
}

impl From<PolicyArg> for ShutdownPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Drain => ShutdownPolicy::Drain,
            PolicyArg::Abort => ShutdownPolicy::Abort,
        }
    }
}

/// Run a demand-driven chain of workshops and feed it customer orders
#[derive(Parser, Debug)]
#[command(name = "workshop_chain")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON chain description; the built-in three-workshop chain otherwise
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Quantities to order, in sequence
    #[arg(short, long, value_delimiter = ',', num_args = 1..)]
    orders: Vec<u64>,

    /// Generate this many random orders after the explicit ones
    #[arg(long, default_value_t = 0)]
    random_orders: u32,

    #[arg(long, default_value_t = 4.0)]
    order_size_mean: f64,

    #[arg(long, default_value_t = 1.5)]
    order_size_std_dev: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Overrides the configured shutdown policy
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Overrides the configured broker handshake timeout
    #[arg(long, value_name = "MS")]
    broker_timeout_ms: Option<u64>,
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .init();

    if let Err(err) = run(Args::parse()) {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ChainConfig::from_file(path)?,
        None => ChainConfig::default(),
    };
    if let Some(policy) = args.policy {
        config = config.with_shutdown_policy(policy.into());
    }
    if let Some(millis) = args.broker_timeout_ms {
        config = config.with_broker_timeout(Duration::from_millis(millis));
    }

    println!("Workshop chain:");
    for workshop in &config.workshops {
        println!(
            "  {} [{}] capacity={} units/product={} latency={}ms",
            workshop.label(),
            workshop.role,
            workshop.buffer_capacity,
            workshop.units_per_product,
            workshop.production_latency_ms
        );
    }

    let orders = order_plan(&args)?;
    if orders.is_empty() {
        warn!("no orders given, the chain will start and stop immediately");
    }

    let mut events = EventBus::default();
    events.subscribe(Arc::new(LoggingObserver));
    let (supervisor, mut customer) = Supervisor::start(config, events)?;

    let terminator = supervisor.terminator();
    ctrlc::set_handler(move || terminator.request())?;

    for quantity in orders {
        match customer.order(quantity) {
            Ok(delivery) => info!(
                "delivered {} piece(s) for cycle {}",
                delivery.quantity, delivery.cycle_id
            ),
            Err(ChainError::ShuttingDown) | Err(ChainError::Shutdown) => {
                warn!("termination requested, no further orders");
                break;
            }
            Err(err) => {
                error!("order of {} failed: {}", quantity, err);
                break;
            }
        }
    }

    if supervisor.is_halted() {
        warn!("chain halted before the order plan finished");
    }
    let delivered = customer.delivered_total();
    customer.terminate();

    println!("\nWorkshop stock at shutdown:");
    for workshop in &supervisor.config().workshops {
        if let Some(snap) = supervisor.snapshot(workshop.id) {
            let raw = snap.raw_stock.map_or_else(|| "infinite".to_string(), |r| r.to_string());
            println!(
                "  {} raw={} produced={} shipped={}",
                workshop.label(),
                raw,
                snap.produced_total,
                snap.delivered_total
            );
        }
    }
    print_client_summary(&supervisor, delivered);

    let report = supervisor.shutdown()?;
    println!(
        "Chain stopped ({:?}, drained: {}, {} task(s) joined)",
        report.policy, report.drained, report.tasks_joined
    );
    Ok(())
}

fn print_client_summary(supervisor: &Supervisor, delivered: u64) {
    let client = supervisor.config().client_end().map(|w| w.id).unwrap_or(WorkshopId(0));
    println!("Customer received {} piece(s) from workshop {}", delivered, client);
}

/// Explicit orders followed by normally distributed random ones (at least 1 piece each)
fn order_plan(args: &Args) -> Result<Vec<u64>, Box<dyn std::error::Error>> {
    let mut plan = args.orders.clone();
    if args.random_orders > 0 {
        let mut rng = StdRng::seed_from_u64(args.seed);
        let sizes = Normal::new(args.order_size_mean, args.order_size_std_dev)?;
        for _ in 0..args.random_orders {
            let size = sizes.sample(&mut rng).round().max(1.0) as u64;
            plan.push(size);
        }
    }
    Ok(plan)
}
