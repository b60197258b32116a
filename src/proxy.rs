use crate::config::{CloudConfig, ProxyConfig};
use crate::forwarder::CloudForwarder;
use crate::frame::{classify, extract_frame, tag_value, verify_crc};
use crate::injector::SettingsInjector;
use crate::pipeline::CommandPipeline;
use crate::session::SessionState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

pub const ACCEPT_POLL_MS: u64 = 500; //cancel flag polling while no box connects
pub const DEVICE_READ_CHUNK: usize = 4096;
pub const DEVICE_BUFFER_CAP: usize = 64 * 1024; //drop unframed input beyond this

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Accepts box connections and runs one [`DeviceConnection`] task per socket.
pub struct DeviceListener {
    pub name: String,
    pub proxy: ProxyConfig,
    pub cloud: CloudConfig,
    pub session: Arc<SessionState>,
    pub injector: Arc<SettingsInjector>,
    pub pipeline: Arc<CommandPipeline>,
}

impl DeviceListener {
    pub async fn worker(&mut self, worker_cancel_flag: Arc<AtomicBool>) -> Result<()> {
        info!("{}: Starting task", self.name);
        let listener = TcpListener::bind(&self.proxy.listen).await?;
        info!(
            "{}: 🔌 waiting for the box on {} in {} mode, cloud: {}",
            self.name,
            listener.local_addr()?,
            self.session.mode,
            self.cloud.host
        );
        self.serve(listener, worker_cancel_flag).await
    }

    pub async fn serve(
        &self,
        listener: TcpListener,
        worker_cancel_flag: Arc<AtomicBool>,
    ) -> Result<()> {
        let mut stats_interval = Instant::now();
        let mut connections: Vec<JoinHandle<()>> = vec![];

        loop {
            if worker_cancel_flag.load(Ordering::SeqCst) {
                debug!("{}: Got terminate signal from main", self.name);
                break;
            }

            if stats_interval.elapsed() > self.proxy.stats_interval {
                stats_interval = Instant::now();
                self.log_stats();
            }

            match timeout(Duration::from_millis(ACCEPT_POLL_MS), listener.accept()).await {
                Err(_) => connections.retain(|c| !c.is_finished()),
                Ok(Err(e)) => {
                    error!("{}: accept error: {}", self.name, e);
                    tokio::time::sleep(Duration::from_millis(ACCEPT_POLL_MS)).await;
                }
                Ok(Ok((stream, peer))) => {
                    let conn_id = self.session.next_conn_id();
                    info!(
                        "{}: 📦 box connected from {} (conn {})",
                        self.name, peer, conn_id
                    );
                    let _ = stream.set_nodelay(true);
                    let mut conn = DeviceConnection {
                        name: format!("conn[{}]", conn_id),
                        conn_id,
                        peer: peer.to_string(),
                        read_timeout: self.proxy.device_read_timeout,
                        session: self.session.clone(),
                        injector: self.injector.clone(),
                        pipeline: self.pipeline.clone(),
                        forwarder: CloudForwarder::new(
                            format!("cloud[{}]", conn_id),
                            self.cloud.clone(),
                            self.session.clone(),
                            self.injector.clone(),
                        ),
                        frames: 0,
                    };
                    let cancel = worker_cancel_flag.clone();
                    connections.push(tokio::spawn(async move {
                        if let Err(e) = conn.run(stream, cancel).await {
                            error!("{}: connection error: {}", conn.name, e);
                        }
                        conn.teardown();
                    }));
                }
            }
        }

        for c in connections {
            c.abort();
        }
        self.log_stats();
        info!("{}: task stopped", self.name);
        Ok(())
    }

    fn log_stats(&self) {
        info!("{}: 📊 cloud: {}", self.name, *self.session.stats());
        info!(
            "{}: 📊 {}, foreign acks: {}",
            self.name,
            *self.session.breaker(),
            self.session.foreign_acks.load(Ordering::SeqCst)
        );
        match self.pipeline.inflight() {
            Some((tx_id, stage)) => info!(
                "{}: 📊 inflight tx {} ({:?}), {} queued",
                self.name,
                tx_id,
                stage,
                self.pipeline.queue_len()
            ),
            None => info!(
                "{}: 📊 no inflight tx, {} queued",
                self.name,
                self.pipeline.queue_len()
            ),
        }
    }
}

/// One box socket: frames are handled strictly in arrival order.
pub struct DeviceConnection {
    pub name: String,
    pub conn_id: u64,
    pub peer: String,
    read_timeout: Duration,
    session: Arc<SessionState>,
    injector: Arc<SettingsInjector>,
    pipeline: Arc<CommandPipeline>,
    forwarder: CloudForwarder,
    frames: u64,
}

impl DeviceConnection {
    pub async fn run(
        &mut self,
        mut stream: TcpStream,
        cancel: Arc<AtomicBool>,
    ) -> std::io::Result<()> {
        self.session.device_connected(self.conn_id, self.peer.clone());
        let mut buf: Vec<u8> = vec![];
        let mut chunk = [0u8; DEVICE_READ_CHUNK];

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Ok(());
            }
            let n = match timeout(self.read_timeout, stream.read(&mut chunk)).await {
                Err(_) => {
                    warn!(
                        "{}: nothing from the box for {}, closing",
                        self.name,
                        humantime::format_duration(self.read_timeout)
                    );
                    return Ok(());
                }
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
            };
            buf.extend_from_slice(&chunk[..n]);

            while let Some(frame) = extract_frame(&mut buf) {
                self.handle_frame(&mut stream, &frame).await?;
            }
            if buf.len() > DEVICE_BUFFER_CAP {
                warn!(
                    "{}: {} bytes without a frame, dropping them",
                    self.name,
                    buf.len()
                );
                buf.clear();
            }
        }
    }

    async fn handle_frame(
        &mut self,
        stream: &mut TcpStream,
        frame: &[u8],
    ) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(frame).into_owned();
        let kind = classify(&text);
        self.frames += 1;
        trace!("{}: 📥 {:?}: {}", self.name, kind, text.trim_end());
        if text.contains("<CRC>") && !verify_crc(&text) {
            debug!("{}: CRC mismatch in {:?} frame, passing it on", self.name, kind);
        }

        self.session
            .frame_received(self.conn_id, tag_value(&text, "ID_Device"));
        let response = self.injector.observe(self.conn_id, &text);
        let reply = self
            .forwarder
            .handle_frame(self.conn_id, frame, &kind, response.as_ref())
            .await;
        let written = match &reply {
            Some(reply) => {
                let written = stream.write_all(&reply.bytes).await;
                trace!(
                    "{}: 📤 {:?} reply: {}",
                    self.name,
                    reply.source,
                    String::from_utf8_lossy(&reply.bytes).trim_end()
                );
                written
            }
            None => {
                debug!("{}: no reply for {:?}, the box will retry", self.name, kind);
                Ok(())
            }
        };
        //the injector has already consumed any answer
        self.pipeline
            .observe_frame(self.conn_id, &text, &kind, response.as_ref());
        written
    }

    /// Releases everything tied to this connection id.
    pub fn teardown(&mut self) {
        if let Some(tx_id) = self.injector.on_disconnect(self.conn_id) {
            warn!("{}: delivered tx {} lost with the connection", self.name, tx_id);
        }
        self.session.device_disconnected(self.conn_id);
        self.forwarder.close_cloud("box_disconnected");
        info!(
            "{}: box {} disconnected after {} frames",
            self.name, self.peer, self.frames
        );
    }
}
