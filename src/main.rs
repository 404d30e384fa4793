use std::io::Write;
use std::path::PathBuf;

use clap::Parser;

use macplus::{Engine, EngineOptions};

/// Rotation bounds for the operational log files under `<data>/logs/`.
const LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
const LOG_KEEP: usize = 5;

#[derive(Debug, Parser)]
#[command(name = "macplus", version)]
#[command(about = "macPlus update engine", long_about = None)]
struct Cli {
    /// Run the engine without a UI host, emitting events to the log.
    #[arg(long)]
    headless: bool,

    /// Perform one scan + check and exit: 0 when up to date, 1 when
    /// updates are available, 2 on error.
    #[arg(long)]
    check_now: bool,
}

/// Size-bounded log sink: `engine.log` up to the limit, then shifted to
/// `engine.log.1` ... `engine.log.N`.
struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    written: u64,
}

impl RotatingWriter {
    fn open(logs_dir: &std::path::Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let path = logs_dir.join("engine.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let oldest = self.path.with_extension(format!("log.{LOG_KEEP}"));
        let _ = std::fs::remove_file(&oldest);
        for i in (1..LOG_KEEP).rev() {
            let from = self.path.with_extension(format!("log.{i}"));
            if from.exists() {
                let _ = std::fs::rename(&from, self.path.with_extension(format!("log.{}", i + 1)));
            }
        }
        let _ = std::fs::rename(&self.path, self.path.with_extension("log.1"));
        self.file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.written + buf.len() as u64 > LOG_MAX_BYTES {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(dirs) = macplus::db::ensure_engine_dirs() {
        if let Ok(writer) = RotatingWriter::open(&dirs.logs) {
            builder.target(env_logger::Target::Pipe(Box::new(writer)));
        }
    }
    builder.init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(2);
        }
    };

    let code = runtime.block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    if cli.check_now {
        return check_now().await;
    }
    if !cli.headless {
        // The bare binary has no UI to offer; run headless either way.
        log::debug!("no --headless flag given; running headless anyway");
    }

    let engine = match Engine::start(EngineOptions::default()).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("engine startup failed: {e}");
            return 2;
        }
    };
    log::info!(
        "macPlus engine {} running headless (data dir: {})",
        engine.version(),
        engine.data_dir().display()
    );

    let mut events = engine.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                return 0;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            log::info!("{json}");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("event stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return 0,
                }
            }
        }
    }
}

async fn check_now() -> i32 {
    let options = EngineOptions {
        launch_policy: false,
        periodic_checks: false,
    };
    let engine = match Engine::start(options).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("engine startup failed: {e}");
            return 2;
        }
    };

    match engine.run_check_now().await {
        Ok(0) => {
            println!("all apps up to date");
            0
        }
        Ok(count) => {
            println!("{count} update(s) available");
            1
        }
        Err(e) => {
            eprintln!("check failed: {e}");
            2
        }
    }
}
