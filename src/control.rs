use crate::pipeline::CommandPipeline;
use crate::status::{BroadcastSink, ControlMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const POLL_INTERVAL_MS: u64 = 500; //cancel flag polling while idle

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// JSON-lines administrative socket: commands in, results and key states out.
pub struct ControlServer {
    pub name: String,
    pub listen: String,
    pub pipeline: Arc<CommandPipeline>,
    pub sink: Arc<BroadcastSink>,
}

impl ControlServer {
    pub async fn worker(&mut self, worker_cancel_flag: Arc<AtomicBool>) -> Result<()> {
        info!("{}: Starting task", self.name);
        let listener = TcpListener::bind(&self.listen).await?;
        info!("{}: 🎛️  listening on {}", self.name, listener.local_addr()?);
        self.serve(listener, worker_cancel_flag).await
    }

    pub async fn serve(
        &self,
        listener: TcpListener,
        worker_cancel_flag: Arc<AtomicBool>,
    ) -> Result<()> {
        let mut clients: Vec<JoinHandle<()>> = vec![];
        loop {
            if worker_cancel_flag.load(Ordering::SeqCst) {
                debug!("{}: Got terminate signal from main", self.name);
                break;
            }

            match timeout(Duration::from_millis(POLL_INTERVAL_MS), listener.accept()).await {
                Err(_) => clients.retain(|c| !c.is_finished()),
                Ok(Err(e)) => {
                    error!("{}: accept error: {}", self.name, e);
                    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                }
                Ok(Ok((stream, peer))) => {
                    let name = format!("{}[{}]", self.name, peer);
                    info!("{}: client connected", name);
                    let pipeline = self.pipeline.clone();
                    let sink = self.sink.clone();
                    let cancel = worker_cancel_flag.clone();
                    clients.push(tokio::spawn(async move {
                        match handle_client(&name, stream, pipeline, sink, cancel).await {
                            Ok(()) => info!("{}: client disconnected", name),
                            Err(e) => warn!("{}: client dropped: {}", name, e),
                        }
                    }));
                }
            }
        }

        for c in clients {
            c.abort();
        }
        info!("{}: task stopped", self.name);
        Ok(())
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, msg: &ControlMessage) -> Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

async fn handle_client(
    name: &str,
    stream: TcpStream,
    pipeline: Arc<CommandPipeline>,
    sink: Arc<BroadcastSink>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    //subscribe before the snapshot so no update falls in between
    let mut updates = sink.subscribe();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    for msg in sink.retained() {
        write_message(&mut writer, &msg).await?;
    }

    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!("{}: command: {}", name, line);
                    //rejections are published as results
                    let _ = pipeline.submit(line);
                }
                None => break,
            },
            msg = updates.recv() => match msg {
                Ok(msg) => write_message(&mut writer, &msg).await?,
                Err(RecvError::Lagged(n)) => warn!("{}: too slow, {} messages skipped", name, n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
        }
    }
    Ok(())
}
