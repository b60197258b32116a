use crate::breaker::Mode;
use crate::config::CloudConfig;
use crate::error::ProxyError;
use crate::frame::{extract_frame, local_end_reply, local_reply_for, FrameKind};
use crate::injector::{DeliveryResponse, SettingsInjector};
use crate::session::SessionState;
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

pub const CLOUD_READ_CHUNK: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplySource {
    Command,
    Cloud,
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub source: ReplySource,
    pub bytes: Vec<u8>,
}

impl Reply {
    fn new(source: ReplySource, bytes: Vec<u8>) -> Self {
        Self { source, bytes }
    }
}

/// Live upstream connection, owned by one device connection.
pub struct CloudSession {
    stream: TcpStream,
    pub peer: String,
    pub connected_since: Instant,
    pub rx_buffer: Vec<u8>,
}

pub struct CloudForwarder {
    pub name: String,
    cfg: CloudConfig,
    session: Arc<SessionState>,
    injector: Arc<SettingsInjector>,
    cloud: Option<CloudSession>,
}

impl CloudForwarder {
    pub fn new(
        name: String,
        cfg: CloudConfig,
        session: Arc<SessionState>,
        injector: Arc<SettingsInjector>,
    ) -> Self {
        Self {
            name,
            cfg,
            session,
            injector,
            cloud: None,
        }
    }

    pub fn is_cloud_connected(&self) -> bool {
        self.cloud.is_some()
    }

    /// Produces the reply for one device frame, or `None` to stay transparent.
    pub async fn handle_frame(
        &mut self,
        conn_id: u64,
        frame: &[u8],
        kind: &FrameKind,
        answered: Option<&DeliveryResponse>,
    ) -> Option<Reply> {
        //the cloud never issued locally injected settings, so their ACK/NACK stays here
        if let Some(resp) = answered {
            debug!(
                "{}: answering {:?} for tx {} locally",
                self.name, resp.outcome, resp.tx_id
            );
            self.session.stats().local_replies += 1;
            return Some(Reply::new(
                ReplySource::Local,
                local_reply_for(kind, Utc::now()).into_bytes(),
            ));
        }

        if let FrameKind::Poll(poll) = kind {
            if let Some(command) = self.injector.take_for_delivery(conn_id) {
                debug!("{}: answering {} with the staged command", self.name, poll.as_str());
                return Some(Reply::new(ReplySource::Command, command.into_bytes()));
            }
        }

        if self.session.breaker().is_offline() {
            return Some(self.local_fallback(kind, "offline_mode"));
        }

        let allowed = self.session.breaker().should_try_cloud();
        if !allowed {
            return Some(self.local_fallback(kind, "breaker_open"));
        }

        match self.forward(frame).await {
            Ok(reply) => {
                self.session.breaker().record_success();
                self.session.stats().forwarded += 1;
                Some(Reply::new(ReplySource::Cloud, reply))
            }
            Err(e) => self.on_failure(kind, e),
        }
    }

    fn on_failure(&mut self, kind: &FrameKind, err: ProxyError) -> Option<Reply> {
        let hybrid = self.session.mode == Mode::Hybrid;
        let reason = err.reason();
        match err {
            ProxyError::Connect { .. } => {
                error!("{}: {}", self.name, err);
                self.session.stats().errors += 1;
                if hybrid {
                    Some(self.local_fallback(kind, reason))
                } else {
                    self.session.breaker().record_failure(reason);
                    None
                }
            }
            ProxyError::AckTimeout(_) => {
                warn!("{}: {} ({:?})", self.name, err, kind);
                self.session.stats().timeouts += 1;
                if !hybrid {
                    //stale late replies must not answer the device's retry
                    self.close_cloud(reason);
                    self.session.breaker().record_failure(reason);
                    None
                } else if kind.is_end() {
                    self.session.breaker().record_failure(reason);
                    self.session.stats().local_replies += 1;
                    Some(Reply::new(
                        ReplySource::Local,
                        local_end_reply(Utc::now()).into_bytes(),
                    ))
                } else {
                    Some(self.local_fallback(kind, reason))
                }
            }
            _ => {
                error!("{}: cloud failure: {}", self.name, err);
                self.session.stats().errors += 1;
                self.close_cloud(reason);
                if hybrid {
                    Some(self.local_fallback(kind, reason))
                } else {
                    self.session.breaker().record_failure(reason);
                    None
                }
            }
        }
    }

    fn local_fallback(&mut self, kind: &FrameKind, reason: &str) -> Reply {
        self.close_cloud(reason);
        self.session.breaker().record_failure(reason);
        self.session.stats().local_replies += 1;
        debug!("{}: local reply for {:?} ({})", self.name, kind, reason);
        Reply::new(
            ReplySource::Local,
            local_reply_for(kind, Utc::now()).into_bytes(),
        )
    }

    pub fn close_cloud(&mut self, reason: &str) {
        if let Some(cloud) = self.cloud.take() {
            info!(
                "{}: closing cloud session to {} after {:?} ({})",
                self.name,
                cloud.peer,
                cloud.connected_since.elapsed(),
                reason
            );
            if !cloud.rx_buffer.is_empty() {
                debug!(
                    "{}: dropping {} unconsumed cloud bytes",
                    self.name,
                    cloud.rx_buffer.len()
                );
            }
            self.session.stats().disconnects += 1;
        }
    }

    async fn connect(&mut self) -> Result<(), ProxyError> {
        if self.cloud.is_some() {
            return Ok(());
        }
        debug!("{}: connecting to {}...", self.name, self.cfg.host);
        let conn = match timeout(self.cfg.connect_timeout, TcpStream::connect(&self.cfg.host)).await
        {
            Ok(res) => res,
            Err(_) => {
                return Err(ProxyError::Connect {
                    host: self.cfg.host.clone(),
                    reason: format!("timeout after {:?}", self.cfg.connect_timeout),
                })
            }
        };
        match conn {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| self.cfg.host.clone());
                info!("{}: ☁️  connected to cloud {}", self.name, peer);
                self.session.stats().connects += 1;
                self.cloud = Some(CloudSession {
                    stream,
                    peer,
                    connected_since: Instant::now(),
                    rx_buffer: vec![],
                });
                Ok(())
            }
            Err(e) => Err(ProxyError::Connect {
                host: self.cfg.host.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn forward(&mut self, frame: &[u8]) -> Result<Vec<u8>, ProxyError> {
        self.connect().await?;
        let cap = self.cfg.rx_buffer_cap;
        let deadline = Instant::now() + self.cfg.ack_timeout;
        let ack_timeout = self.cfg.ack_timeout;
        let name = &self.name;
        let cloud = match self.cloud.as_mut() {
            Some(c) => c,
            None => return Err(ProxyError::CloudClosed),
        };

        cloud.stream.write_all(frame).await?;
        let now = Instant::now();

        let mut chunk = [0u8; CLOUD_READ_CHUNK];
        loop {
            if let Some(reply) = extract_frame(&mut cloud.rx_buffer) {
                trace!(
                    "{}: cloud reply [⏱  {} ms]: {}",
                    name,
                    now.elapsed().as_millis(),
                    String::from_utf8_lossy(&reply)
                );
                return Ok(reply);
            }
            if cloud.rx_buffer.len() >= cap {
                warn!(
                    "{}: {} cloud bytes without a frame boundary, passing them through",
                    name,
                    cloud.rx_buffer.len()
                );
                return Ok(std::mem::take(&mut cloud.rx_buffer));
            }
            match timeout_at(deadline, cloud.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ProxyError::CloudClosed),
                Ok(Ok(n)) => cloud.rx_buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ProxyError::AckTimeout(ack_timeout)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{tag_value, PollKind};
    use crate::injector::{AckOutcome, StageRequest};
    use std::time::Duration;
    use tokio::net::TcpListener;

    const DATA: &[u8] = b"<Frame><TblName>tbl_actual</TblName><ID_Device>2206237016</ID_Device></Frame>\r\n";
    const POLL: &[u8] = b"<Frame><Result>IsNewSet</Result><ID_Device>2206237016</ID_Device></Frame>\r\n";
    const END: &[u8] = b"<Frame><Result>END</Result></Frame>\r\n";
    const CLOUD_ACK: &[u8] = b"<Frame><Result>ACK</Result><ToDo>GetActual</ToDo><CRC>12345</CRC></Frame>\r\n";

    fn data_kind() -> FrameKind {
        FrameKind::Table("tbl_actual".into())
    }

    fn cloud_cfg(host: String) -> CloudConfig {
        CloudConfig {
            host,
            connect_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(200),
            ..CloudConfig::default()
        }
    }

    fn forwarder(
        mode: Mode,
        host: String,
    ) -> (Arc<SessionState>, Arc<SettingsInjector>, CloudForwarder) {
        let session = Arc::new(SessionState::new(mode, 3, Duration::from_secs(60)));
        let injector = Arc::new(SettingsInjector::new(session.clone(), Duration::from_secs(60)));
        let fwd = CloudForwarder::new(
            "forwarder[1]".into(),
            cloud_cfg(host),
            session.clone(),
            injector.clone(),
        );
        (session, injector, fwd)
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    /// Cloud that answers each received chunk with the next scripted reply.
    async fn scripted_cloud(replies: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            for reply in replies {
                if sock.read(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                if !reply.is_empty() {
                    sock.write_all(&reply).await.unwrap();
                }
            }
            //hold the connection open without answering
            let _ = sock.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        addr
    }

    fn stage(injector: &SettingsInjector) {
        injector
            .stage(&StageRequest {
                tx_id: "t1",
                request_key: "tbl_box_prms/MODE/2",
                device_id: "2206237016",
                table: "tbl_box_prms",
                item: "MODE",
                value: "2",
                confirm: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn forwards_and_reuses_the_cloud_session() {
        let host = scripted_cloud(vec![CLOUD_ACK.to_vec(), CLOUD_ACK.to_vec()]).await;
        let (session, _, mut fwd) = forwarder(Mode::Online, host);

        let reply = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
        assert_eq!(reply.source, ReplySource::Cloud);
        assert_eq!(reply.bytes, CLOUD_ACK.to_vec());
        let reply = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
        assert_eq!(reply.bytes, CLOUD_ACK.to_vec());

        let stats = session.stats().clone();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.forwarded, 2);
        assert!(fwd.is_cloud_connected());
    }

    #[tokio::test]
    async fn buffered_second_frame_answers_the_next_request() {
        let two = [CLOUD_ACK, b"<Frame><Result>END</Result></Frame>".as_ref()].concat();
        let host = scripted_cloud(vec![two]).await;
        let (_, _, mut fwd) = forwarder(Mode::Online, host);

        let first = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
        assert_eq!(first.bytes, CLOUD_ACK.to_vec());
        //cloud stays silent now, the reply must come from the buffer
        let second = fwd.handle_frame(1, END, &FrameKind::End, None).await.unwrap();
        assert_eq!(second.bytes, b"<Frame><Result>END</Result></Frame>".to_vec());
    }

    #[tokio::test]
    async fn oversized_non_frame_stream_is_passed_through() {
        let host = scripted_cloud(vec![vec![b'x'; 5000]]).await;
        let (_, _, mut fwd) = forwarder(Mode::Online, host);

        let reply = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
        assert_eq!(reply.source, ReplySource::Cloud);
        assert!(reply.bytes.len() >= 4096);
        assert!(reply.bytes.iter().all(|b| *b == b'x'));
    }

    #[tokio::test]
    async fn online_ack_timeout_stays_transparent() {
        let host = scripted_cloud(vec![vec![]]).await;
        let (session, _, mut fwd) = forwarder(Mode::Online, host);

        assert!(fwd.handle_frame(1, DATA, &data_kind(), None).await.is_none());
        assert_eq!(session.stats().timeouts, 1);
        let breaker = session.breaker();
        assert_eq!(breaker.consecutive_failures, 0);
        assert!(!breaker.tripped);
    }

    #[tokio::test]
    async fn online_marker_timeout_gets_no_local_reply() {
        let host = scripted_cloud(vec![vec![]]).await;
        let (_, _, mut fwd) = forwarder(Mode::Online, host);
        assert!(fwd.handle_frame(1, END, &FrameKind::End, None).await.is_none());
    }

    #[tokio::test]
    async fn online_connect_failure_sends_nothing() {
        let (session, _, mut fwd) = forwarder(Mode::Online, closed_port().await);
        assert!(fwd.handle_frame(1, DATA, &data_kind(), None).await.is_none());
        assert_eq!(session.stats().errors, 1);
        assert!(!session.breaker().tripped);
    }

    #[tokio::test]
    async fn hybrid_trips_after_three_connect_failures() {
        let (session, _, mut fwd) = forwarder(Mode::Hybrid, closed_port().await);

        for _ in 0..3 {
            let reply = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
            assert_eq!(reply.source, ReplySource::Local);
            assert_eq!(tag_value(&String::from_utf8_lossy(&reply.bytes), "Result"), Some("ACK"));
        }
        assert!(session.breaker().tripped);
        assert_eq!(session.stats().errors, 3);

        let reply = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
        assert_eq!(reply.source, ReplySource::Local);
        assert_eq!(session.stats().errors, 3, "no connect attempted while tripped");
    }

    #[tokio::test]
    async fn hybrid_marker_timeout_answers_end_and_keeps_session() {
        let host = scripted_cloud(vec![vec![]]).await;
        let (session, _, mut fwd) = forwarder(Mode::Hybrid, host);

        let reply = fwd.handle_frame(1, END, &FrameKind::End, None).await.unwrap();
        assert_eq!(reply.source, ReplySource::Local);
        assert_eq!(tag_value(&String::from_utf8_lossy(&reply.bytes), "Result"), Some("END"));
        assert!(fwd.is_cloud_connected());
        assert_eq!(session.breaker().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn hybrid_data_timeout_falls_back_and_closes() {
        let host = scripted_cloud(vec![vec![]]).await;
        let (session, _, mut fwd) = forwarder(Mode::Hybrid, host);

        let reply = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
        assert_eq!(reply.source, ReplySource::Local);
        assert!(!fwd.is_cloud_connected());
        assert_eq!(session.stats().disconnects, 1);
    }

    #[tokio::test]
    async fn hybrid_cloud_eof_falls_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            //dropping the socket closes it
        });
        let (session, _, mut fwd) = forwarder(Mode::Hybrid, host);

        let reply = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
        assert_eq!(reply.source, ReplySource::Local);
        assert!(!fwd.is_cloud_connected());
        assert_eq!(session.breaker().last_failure.as_deref(), Some("cloud_eof"));
    }

    #[tokio::test]
    async fn staged_command_rides_on_poll_in_every_mode() {
        for mode in [Mode::Online, Mode::Hybrid, Mode::Offline] {
            let (session, injector, mut fwd) = forwarder(mode, closed_port().await);
            session.device_connected(4, "10.0.0.5:40000".into());
            stage(&injector);
            let staged = injector.pending().unwrap().frame;

            let kind = FrameKind::Poll(PollKind::IsNewSet);
            let reply = fwd.handle_frame(4, POLL, &kind, None).await.unwrap();
            assert_eq!(reply.source, ReplySource::Command, "{}", mode);
            assert_eq!(reply.bytes, staged.into_bytes());
            assert_eq!(injector.pending().unwrap().delivered_on(), Some(4));

            let stats = session.stats().clone();
            assert_eq!(stats.connects + stats.errors, 0, "no cloud contact in {}", mode);
        }
    }

    #[tokio::test]
    async fn stale_connection_poll_goes_to_the_cloud_path() {
        let (session, injector, mut fwd) = forwarder(Mode::Offline, closed_port().await);
        session.device_connected(4, "10.0.0.5:40000".into());
        session.device_connected(5, "10.0.0.5:40001".into());
        stage(&injector);

        let kind = FrameKind::Poll(PollKind::IsNewSet);
        let reply = fwd.handle_frame(4, POLL, &kind, None).await.unwrap();
        assert_eq!(reply.source, ReplySource::Local);
        assert_eq!(injector.pending().unwrap().delivered_on(), None);
    }

    #[tokio::test]
    async fn offline_mode_always_replies_locally() {
        let (session, _, mut fwd) = forwarder(Mode::Offline, closed_port().await);
        let poll = FrameKind::Poll(PollKind::IsNewWeather);
        let reply = fwd.handle_frame(1, POLL, &poll, None).await.unwrap();
        assert_eq!(tag_value(&String::from_utf8_lossy(&reply.bytes), "Result"), Some("END"));
        let reply = fwd.handle_frame(1, DATA, &data_kind(), None).await.unwrap();
        assert_eq!(tag_value(&String::from_utf8_lossy(&reply.bytes), "Result"), Some("ACK"));
        assert_eq!(session.stats().local_replies, 2);
        assert_eq!(session.stats().connects + session.stats().errors, 0);
    }

    #[tokio::test]
    async fn setting_answers_are_acknowledged_locally() {
        let (session, _, mut fwd) = forwarder(Mode::Online, closed_port().await);
        let resp = DeliveryResponse {
            tx_id: "t1".into(),
            request_key: "tbl_box_prms/MODE/2".into(),
            conn_id: 1,
            outcome: AckOutcome::Ack,
        };
        let frame = b"<Frame><Result>ACK</Result><Reason>Setting</Reason></Frame>";
        let reply = fwd
            .handle_frame(1, frame, &FrameKind::Ack, Some(&resp))
            .await
            .unwrap();
        assert_eq!(reply.source, ReplySource::Local);
        assert_eq!(session.stats().errors, 0);
    }
}
