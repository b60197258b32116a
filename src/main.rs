#[macro_use]
extern crate log;
extern crate ctrlc;
extern crate simplelog;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, SimpleLogger, TermLogger,
    TerminalMode, WriteLogger,
};

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::control::ControlServer;
use crate::injector::SettingsInjector;
use crate::pending_store::PendingStore;
use crate::pipeline::CommandPipeline;
use crate::proxy::DeviceListener;
use crate::session::SessionState;
use crate::status::BroadcastSink;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod breaker;
mod config;
mod control;
mod error;
mod event_log;
mod forwarder;
mod frame;
mod injector;
mod pending_store;
mod pipeline;
mod proxy;
mod session;
mod status;
mod whitelist;

fn logging_init(log_path: Option<&str>, level: LevelFilter) {
    let conf = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Off)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![];

    if std::io::stdout().is_terminal() {
        loggers.push(TermLogger::new(
            level,
            conf.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    } else {
        loggers.push(SimpleLogger::new(level, conf.clone()));
    }

    let mut logfile_error: Option<String> = None;
    if let Some(log_path) = log_path {
        let logfile = OpenOptions::new().create(true).append(true).open(log_path);
        match logfile {
            Ok(logfile) => {
                loggers.push(WriteLogger::new(LevelFilter::Info, conf, logfile));
            }
            Err(e) => {
                logfile_error = Some(format!(
                    "Error creating/opening log file: {:?}: {:?}",
                    log_path, e
                ));
            }
        }
    }

    CombinedLogger::init(loggers).expect("Cannot initialize logging subsystem");
    if let Some(e) = logfile_error {
        error!("{}", e);
        warn!("Will do console logging only...");
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = Config::load(&config_path).expect("Cannot load config file");
    logging_init(config.general.log.as_deref(), config.general.log_level);
    info!(
        "Welcome to oig-proxy v{} (OIG box <-> cloud proxy)",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "config: {}, mode: {}, box: {}, cloud: {}, control: {}",
        config_path,
        config.proxy.mode,
        config.proxy.listen,
        config.cloud.host,
        config.control.listen
    );

    //Ctrl-C / SIGTERM support
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    //shared state
    let mut tasks = vec![];
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let session = Arc::new(SessionState::new(
        config.proxy.mode,
        config.cloud.hybrid_fail_threshold,
        config.cloud.hybrid_retry_interval,
    ));
    let injector = Arc::new(SettingsInjector::new(
        session.clone(),
        config.control.ack_timeout,
    ));
    let sink = Arc::new(BroadcastSink::new());
    let pipeline = Arc::new(CommandPipeline::new(
        config.control.clone(),
        session.clone(),
        injector.clone(),
        sink.clone(),
        PendingStore::new(&config.general.state_file),
    ));
    let recovered = pipeline.recover_from_restart();
    if recovered > 0 {
        warn!(
            "{} command(s) were pending when the proxy last stopped, reported as failed",
            recovered
        );
    }

    //box listener
    let mut device_listener = DeviceListener {
        name: "box".to_string(),
        proxy: config.proxy.clone(),
        cloud: config.cloud.clone(),
        session: session.clone(),
        injector: injector.clone(),
        pipeline: pipeline.clone(),
    };
    let worker_cancel_flag = cancel_flag.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = device_listener.worker(worker_cancel_flag).await {
            error!("{}: task failed: {}", device_listener.name, e);
        }
    }));

    //administrative socket
    let mut control = ControlServer {
        name: "control".to_string(),
        listen: config.control.listen.clone(),
        pipeline: pipeline.clone(),
        sink: sink.clone(),
    };
    let worker_cancel_flag = cancel_flag.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = control.worker(worker_cancel_flag).await {
            error!("{}: task failed: {}", control.name, e);
        }
    }));

    debug!("Entering main loop...");
    loop {
        if !running.load(Ordering::SeqCst) {
            info!("Ctrl-C or SIGTERM signal detected, exiting...");
            break;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("Stopping all tasks...");
    //inform all tasks about termination
    cancel_flag.store(true, Ordering::SeqCst);
    //wait for termination
    futures::future::join_all(tasks).await;
    if let Some((tx_id, stage)) = pipeline.inflight() {
        warn!(
            "tx {} still {:?}, it will be reported after restart",
            tx_id, stage
        );
    }
    info!("Done, exiting");
}
