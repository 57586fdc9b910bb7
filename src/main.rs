use anyhow::Context;
use distributed_runtime::config::RuntimeConfig;
use distributed_runtime::error::panic_message;
use distributed_runtime::group::local::LocalGroup;
use distributed_runtime::group::tcp::TcpGroup;
use distributed_runtime::group::types::ProcessGroup;
use distributed_runtime::rmi::types::Dispatch;
use distributed_runtime::storage::memory::DistributedMap;
use distributed_runtime::world::World;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

enum Mode {
    Local(usize),
    Tcp { rank: usize, peers: Vec<SocketAddr> },
}

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} --local <ranks> [--config <file>]", program);
    eprintln!("       {} --rank <r> --peers <addr,addr,...> [--config <file>]", program);
    eprintln!("Example: {} --local 4", program);
    eprintln!(
        "Example: {} --rank 0 --peers 127.0.0.1:7000,127.0.0.1:7001",
        program
    );
    std::process::exit(1);
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut local: Option<usize> = None;
    let mut rank: Option<usize> = None;
    let mut peers: Vec<SocketAddr> = vec![];
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--local", Some(value)) => {
                local = Some(value.parse().context("--local expects a rank count")?);
                i += 2;
            }
            ("--rank", Some(value)) => {
                rank = Some(value.parse().context("--rank expects a number")?);
                i += 2;
            }
            ("--peers", Some(value)) => {
                for addr in value.split(',').filter(|a| !a.is_empty()) {
                    peers.push(addr.parse().with_context(|| format!("bad peer address {}", addr))?);
                }
                i += 2;
            }
            ("--config", Some(value)) => {
                config_path = Some(PathBuf::from(value));
                i += 2;
            }
            _ => usage(&args[0]),
        }
    }

    let mode = match (local, rank) {
        (Some(ranks), None) if ranks > 0 => Mode::Local(ranks),
        (None, Some(rank)) if !peers.is_empty() => Mode::Tcp { rank, peers },
        _ => usage(&args[0]),
    };

    let config = match &config_path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::from_env()?,
    };

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .with_thread_names(true)
        .init();

    match mode {
        Mode::Local(ranks) => {
            tracing::info!("Starting {} in-process ranks", ranks);
            let handles: Vec<_> = LocalGroup::create(ranks)
                .into_iter()
                .map(|group| {
                    let config = config.clone();
                    std::thread::spawn(move || run_rank(group, config))
                })
                .collect();

            for handle in handles {
                // `run_rank` never unwinds; a failing rank exits the process.
                let _ = handle.join();
            }
        }
        Mode::Tcp { rank, peers } => {
            tracing::info!("Starting rank {} of {}", rank, peers.len());
            let group = TcpGroup::connect(rank, &peers)?;
            run_rank(Arc::new(group), config);
        }
    }

    Ok(())
}

/// Runs the scenario on one rank. A rank that fails or panics exits the
/// whole process, since its peers would wait for it at the next collective.
fn run_rank(group: Arc<dyn ProcessGroup>, config: RuntimeConfig) {
    let rank = group.rank();
    let outcome = catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<()> {
        let world = World::new(group, config)?;
        run_scenario(&world)
    }));

    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => format!("{:#}", err),
        Err(payload) => panic_message(payload.as_ref()),
    };
    tracing::error!("Rank {} failed: {}", rank, failure);
    std::process::exit(1);
}

/// The end-to-end scenario every rank runs.
fn run_scenario(world: &Arc<World>) -> anyhow::Result<()> {
    let rank = world.rank();
    let size = world.size();

    // 1. Remote procedure call:
    let increment = world
        .rmi()
        .register_typed::<i64, i64, _>("increment", Dispatch::Inline, |_, x| Ok(x + 1))?;
    world.verify_handlers()?;

    let answer = world.rmi().call::<i64, i64>((rank + 1) % size, increment, &5).get()?;
    anyhow::ensure!(answer == 6, "increment returned {}", answer);
    tracing::info!("Rank {}: increment(5) on rank {} = {}", rank, (rank + 1) % size, answer);

    // 2. Distributed container:
    let books = DistributedMap::<String, String>::new(world)?;
    let keys: Vec<String> = (0..size * 8).map(|i| format!("book_{}", i)).collect();
    books.verify_owners(&keys)?;

    if rank == 0 {
        for key in &keys {
            books.replace(key.clone(), format!("title of {}", key))?;
        }
    }
    world.fence();

    let mut found = 0;
    for key in &keys {
        if books.find(key).get()?.is_some() {
            found += 1;
        }
    }
    anyhow::ensure!(found == keys.len(), "found {} of {} books", found, keys.len());
    tracing::info!(
        "Rank {}: all {} books visible, {} stored locally",
        rank,
        found,
        books.local_size()
    );

    // 3. Remote item operations:
    books.register_op("borrow", Dispatch::Inline, |key: &String, item: &mut Option<String>, who: u64| {
        let title = item.clone().unwrap_or_else(|| key.clone());
        *item = Some(format!("{} (borrowed by rank {})", title, who));
        Ok(())
    })?;
    world.fence();

    let mine = &keys[rank % keys.len()];
    books.invoke::<u64, ()>(mine.clone(), "borrow", rank as u64).get()?;
    world.fence();

    // 4. Local tasks:
    let tasks: Vec<_> = (1..=100u64)
        .map(|n| world.pool().submit(move || n * n))
        .collect::<Result<_, _>>()?;
    let mut sum = 0;
    for task in &tasks {
        sum += task.get()?;
    }
    anyhow::ensure!(sum == 338_350, "sum of squares was {}", sum);
    tracing::info!("Rank {}: pool computed sum of squares {}", rank, sum);

    let stats = world.rmi().stats();
    tracing::info!(
        "Rank {}: sent={} processed={} replies={} handlers={}",
        rank,
        stats.sent,
        stats.processed,
        stats.replies,
        world.rmi().registry().handler_count()
    );

    books.destroy();
    world.shutdown()?;
    Ok(())
}
