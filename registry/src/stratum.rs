//! The Stratum wire layer: a line-delimited JSON-RPC TCP front end over
//! `TemplateRegistry`.
//!
//! Each accepted connection owns a `DownstreamClient` tracking its
//! subscription/authorization state and negotiated parameters. A
//! `Notifier` task turns registry broadcast events into `mining.notify`
//! traffic fanned out to every subscribed connection. `mining.submit`
//! is translated directly into a `TemplateRegistry::submit_share` call.

use crate::error::{StratumErrors, SubmitError};
use crate::registry::TemplateRegistry;
use futures::{lock::Mutex, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    sync::mpsc,
};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Stratum listener configuration.
#[derive(Debug, Clone)]
pub struct StratumServerConfig {
    pub hostname: String,
    pub port: u16,
    /// Initial difficulty assigned to newly subscribed clients, sent
    /// eagerly via `mining.set_difficulty`.
    pub start_difficulty: f64,
}

impl Default for StratumServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::from("0.0.0.0"),
            port: 3333,
            start_difficulty: 1.0,
        }
    }
}

/// A standard `Client -> Server` Stratum request: `mining.subscribe`,
/// `mining.configure`, `mining.authorize`, `mining.submit`,
/// `mining.suggest_difficulty`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StandardRequest {
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

/// A `Server -> Client` JSON-RPC response to a `StandardRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardResponse {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl StandardResponse {
    pub fn new_ok(id: Option<u64>, result: Value) -> Self {
        StandardResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn new_err(id: Option<u64>, error: String) -> Self {
        StandardResponse {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A `mining.notify` broadcast, built from a template's precomputed
/// [`crate::template::BroadcastArgs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub method: String,
    pub params: (String, String, String, String, Vec<String>, String, String, String, bool),
}

impl JobNotification {
    fn new(args: &crate::template::BroadcastArgs, clean_jobs: bool) -> Self {
        JobNotification {
            method: "mining.notify".to_string(),
            params: (
                args.job_id.clone(),
                args.prevhash_hex.clone(),
                args.coinb1_hex.clone(),
                args.coinb2_hex.clone(),
                args.merkle_branch_hex.clone(),
                args.version_hex.clone(),
                args.nbits_hex.clone(),
                args.ntime_hex.clone(),
                clean_jobs,
            ),
        }
    }
}

/// Per-connection session state, populated over the course of
/// `mining.subscribe` / `mining.configure` / `mining.authorize`.
#[derive(Debug, Clone)]
pub struct DownstreamClient {
    pub authorized: bool,
    pub subscribed: bool,
    pub downstream_ip: String,
    pub channel_configured: bool,
    extranonce1: Vec<u8>,
    extranonce2_len: usize,
    version_rolling_mask: Option<String>,
    version_rolling_min_bit: Option<u32>,
    difficulty: f64,
}

impl DownstreamClient {
    fn new(extranonce1: Vec<u8>, extranonce2_len: usize, start_difficulty: f64) -> Self {
        DownstreamClient {
            authorized: false,
            subscribed: false,
            downstream_ip: String::new(),
            channel_configured: false,
            extranonce1,
            extranonce2_len,
            version_rolling_mask: None,
            version_rolling_min_bit: None,
            difficulty: start_difficulty,
        }
    }

    /// Routes a parsed request to the matching handler and returns the
    /// JSON-encoded response line to write back to the connection, or
    /// an error that ends the connection.
    pub async fn handle_request(
        &mut self,
        registry: &TemplateRegistry,
        request: &StandardRequest,
    ) -> Result<String, StratumErrors> {
        let response = match request.method.as_str() {
            "mining.configure" => self.handle_configure(&request.params, request.id),
            "mining.subscribe" => self.handle_subscribe(registry, &request.params, request.id),
            "mining.authorize" => self.handle_authorize(&request.params, request.id),
            "mining.suggest_difficulty" => self.handle_suggest_difficulty(&request.params, request.id),
            "mining.submit" => self.handle_submit(registry, &request.params, request.id).await,
            method => Err(StratumErrors::InvalidMethod {
                method: method.to_string(),
            }),
        }?;
        Ok(serde_json::to_string(&response).unwrap())
    }

    /// `mining.configure` (BIP 310): negotiates version-rolling. Only
    /// the mask/min-bit-count fields are tracked; the pool does not
    /// currently roll the version bits itself.
    fn handle_configure(
        &mut self,
        params: &Value,
        request_id: u64,
    ) -> Result<StandardResponse, StratumErrors> {
        let params = params.as_array().ok_or(StratumErrors::InvalidMethodParams {
            method: "mining.configure".to_string(),
        })?;
        let config_map = params
            .get(1)
            .and_then(|v| v.as_object())
            .ok_or(StratumErrors::ParamNotFound {
                param: "configuration_map".to_string(),
                method: "mining.configure".to_string(),
            })?;

        if let Some(mask) = config_map.get("version-rolling.mask").and_then(|v| v.as_str()) {
            self.version_rolling_mask = Some(mask.to_string());
        }
        if let Some(min_bits) = config_map
            .get("version-rolling.min-bit-count")
            .and_then(|v| v.as_u64())
        {
            self.version_rolling_min_bit = Some(min_bits as u32);
        }
        self.channel_configured = true;

        Ok(StandardResponse::new_ok(
            Some(request_id),
            json!({
                "version-rolling": true,
                "version-rolling.mask": self.version_rolling_mask.clone().unwrap_or_else(|| "1fffe000".to_string()),
                "version-rolling.min-bit-count": self.version_rolling_min_bit.unwrap_or(0),
            }),
        ))
    }

    /// `mining.subscribe`: allocates this connection its own extranonce1
    /// from the registry's counter and reports the registry's fixed
    /// extranonce2 size.
    fn handle_subscribe(
        &mut self,
        registry: &TemplateRegistry,
        _params: &Value,
        request_id: u64,
    ) -> Result<StandardResponse, StratumErrors> {
        self.extranonce1 = registry.allocate_extranonce1();
        self.extranonce2_len = registry.extranonce2_size;
        self.subscribed = true;

        let subscriptions: Vec<(String, String)> = vec![
            ("mining.set_difficulty".to_string(), "1".to_string()),
            ("mining.notify".to_string(), "1".to_string()),
        ];
        Ok(StandardResponse::new_ok(
            Some(request_id),
            json!([subscriptions, hex::encode(&self.extranonce1), self.extranonce2_len]),
        ))
    }

    /// `mining.authorize`: the pool accepts any worker/password pair;
    /// payout accounting by worker name is out of scope here.
    fn handle_authorize(
        &mut self,
        params: &Value,
        request_id: u64,
    ) -> Result<StandardResponse, StratumErrors> {
        let params = params.as_array().ok_or(StratumErrors::InvalidMethodParams {
            method: "mining.authorize".to_string(),
        })?;
        let _worker_name = params.first().and_then(|v| v.as_str()).ok_or(StratumErrors::ParamNotFound {
            param: "username".to_string(),
            method: "mining.authorize".to_string(),
        })?;
        self.authorized = true;
        Ok(StandardResponse::new_ok(Some(request_id), json!(true)))
    }

    /// `mining.suggest_difficulty`: records the client's requested
    /// difficulty and echoes it back via the synchronous response.
    fn handle_suggest_difficulty(
        &mut self,
        params: &Value,
        request_id: u64,
    ) -> Result<StandardResponse, StratumErrors> {
        let difficulty = params
            .get(0)
            .and_then(|v| v.as_f64())
            .ok_or(StratumErrors::InvalidMethodParams {
                method: "mining.suggest_difficulty".to_string(),
            })?;
        self.difficulty = difficulty;
        Ok(StandardResponse::new_ok(Some(request_id), json!(difficulty)))
    }

    /// `mining.submit`: decodes `[worker_name, job_id, extranonce2,
    /// ntime, nonce]` and delegates straight into
    /// `TemplateRegistry::submit_share`. `AboveTarget`/
    /// `RiecoinBelowTarget` come back as an ordinary `result: false`
    /// (a real share that simply missed target); every other
    /// `SubmitError` becomes a Stratum error response.
    async fn handle_submit(
        &mut self,
        registry: &TemplateRegistry,
        params: &Value,
        request_id: u64,
    ) -> Result<StandardResponse, StratumErrors> {
        let params = params.as_array().ok_or(StratumErrors::InvalidMethodParams {
            method: "mining.submit".to_string(),
        })?;
        if params.len() < 5 {
            return Err(StratumErrors::InvalidMethodParams {
                method: "mining.submit".to_string(),
            });
        }
        let param_str = |idx: usize, name: &str| -> Result<&str, StratumErrors> {
            params
                .get(idx)
                .and_then(|v| v.as_str())
                .ok_or(StratumErrors::ParamNotFound {
                    param: name.to_string(),
                    method: "mining.submit".to_string(),
                })
        };
        let worker_name = param_str(0, "worker_name")?;
        let job_id = param_str(1, "job_id")?;
        let extranonce2_hex = param_str(2, "extranonce2")?;
        let ntime_hex = param_str(3, "ntime")?;
        let nonce_hex = param_str(4, "nonce")?;

        match registry
            .submit_share(job_id, &self.extranonce1, extranonce2_hex, ntime_hex, nonce_hex, self.difficulty)
            .await
        {
            Ok(accepted) => {
                log::info!(
                    "worker {worker_name} share accepted for job {job_id} at difficulty {:.2}",
                    accepted.share_diff
                );
                Ok(StandardResponse::new_ok(Some(request_id), json!(true)))
            }
            Err(SubmitError::AboveTarget) | Err(SubmitError::RiecoinBelowTarget) => {
                log::warn!("worker {worker_name} share for job {job_id} missed target");
                Ok(StandardResponse::new_ok(Some(request_id), json!(false)))
            }
            Err(e) => {
                log::warn!("worker {worker_name} share for job {job_id} rejected: {e}");
                Err(e.into())
            }
        }
    }
}

/// Tells the notifier task what to fan out to downstream connections.
pub enum NotifyCmd {
    /// A new or refreshed template is available; `clean_jobs` mirrors
    /// the registry's chain-tip-advance signal.
    Broadcast { clean_jobs: bool },
    /// A connection just finished subscribing; send it the latest
    /// template directly rather than waiting for the next broadcast.
    SendLatestTemplateToNewDownstream { new_downstream_addr: String },
}

/// Bridges `TemplateRegistry`'s synchronous callbacks into the
/// notifier's async command channel. `add_template` invokes these
/// while holding the registry lock, so sends must be non-blocking;
/// `try_send` on a generously sized channel satisfies that.
pub struct NotifyBridge {
    sender: mpsc::Sender<NotifyCmd>,
}

impl NotifyBridge {
    pub fn new(sender: mpsc::Sender<NotifyCmd>) -> Self {
        NotifyBridge { sender }
    }
}

impl crate::callbacks::OnBlockCallback for NotifyBridge {
    fn on_block(&self, prevhash_hex: &str, height: u64) {
        log::info!("chain tip advanced to {prevhash_hex} at height {height}");
    }
}

impl crate::callbacks::OnTemplateCallback for NotifyBridge {
    fn on_template(&self, clean_jobs: bool) {
        if let Err(e) = self.sender.try_send(NotifyCmd::Broadcast { clean_jobs }) {
            log::warn!("failed to queue mining.notify broadcast: {e}");
        }
    }
}

/// Fans out `mining.notify` to every connected, subscribed downstream.
pub struct Notifier {
    notification_receiver: mpsc::Receiver<NotifyCmd>,
    registry: Arc<TemplateRegistry>,
    connections: Arc<Mutex<ConnectionMapping>>,
}

impl Notifier {
    pub fn new(
        notification_rx: mpsc::Receiver<NotifyCmd>,
        registry: Arc<TemplateRegistry>,
        connections: Arc<Mutex<ConnectionMapping>>,
    ) -> Self {
        Self {
            notification_receiver: notification_rx,
            registry,
            connections,
        }
    }

    pub async fn run(&mut self) {
        while let Some(cmd) = self.notification_receiver.recv().await {
            let Some(template) = self.registry.last_block().await else {
                continue;
            };
            match cmd {
                NotifyCmd::Broadcast { clean_jobs } => {
                    let job = JobNotification::new(&template.broadcast_args, clean_jobs);
                    let line = serde_json::to_string(&job).unwrap();
                    self.send_to_all(&line).await;
                }
                NotifyCmd::SendLatestTemplateToNewDownstream { new_downstream_addr } => {
                    let job = JobNotification::new(&template.broadcast_args, true);
                    let line = serde_json::to_string(&job).unwrap();
                    self.send_to_one(&new_downstream_addr, &line).await;
                }
            }
        }
    }

    async fn send_to_all(&self, line: &str) {
        for (addr, sender) in self.connections.lock().await.iter() {
            if sender.send(line.to_string()).await.is_err() {
                log::warn!("failed to deliver mining.notify to {addr}");
            }
        }
    }

    async fn send_to_one(&self, addr: &str, line: &str) {
        if let Some(sender) = self.connections.lock().await.get(addr) {
            if sender.send(line.to_string()).await.is_err() {
                log::warn!("failed to deliver mining.notify to {addr}");
            }
        }
    }
}

/// Registry of per-connection outbound channels, keyed by peer address.
#[derive(Debug, Default)]
pub struct ConnectionMapping {
    downstream_channel_mapping: HashMap<String, mpsc::Sender<String>>,
}

impl ConnectionMapping {
    pub fn new() -> Self {
        ConnectionMapping {
            downstream_channel_mapping: HashMap::new(),
        }
    }

    fn new_connection(&mut self, peer_addr: String, sender: mpsc::Sender<String>) {
        self.downstream_channel_mapping.insert(peer_addr, sender);
    }

    fn remove_connection(&mut self, peer_addr: &str) {
        self.downstream_channel_mapping.remove(peer_addr);
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &mpsc::Sender<String>)> {
        self.downstream_channel_mapping.iter()
    }

    fn get(&self, peer_addr: &str) -> Option<&mpsc::Sender<String>> {
        self.downstream_channel_mapping.get(peer_addr)
    }
}

/// The Stratum TCP listener.
pub struct Server {
    config: StratumServerConfig,
    connections: Arc<Mutex<ConnectionMapping>>,
}

impl Server {
    pub fn new(config: StratumServerConfig, connections: Arc<Mutex<ConnectionMapping>>) -> Self {
        log::info!("initializing stratum server with config: {config:?}");
        Self { config, connections }
    }

    /// Accepts connections forever, spawning a task per connection.
    pub async fn run(
        &self,
        registry: Arc<TemplateRegistry>,
        notification_sender: mpsc::Sender<NotifyCmd>,
    ) -> Result<(), std::io::Error> {
        let bind_address = format!("{}:{}", self.config.hostname, self.config.port);
        let listener = TcpListener::bind(&bind_address).await.map_err(|e| {
            log::error!("failed to bind stratum server to {bind_address}: {e}");
            e
        })?;
        log::info!("stratum server listening on {bind_address}");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let registry = registry.clone();
                    let connections = self.connections.clone();
                    let notification_sender = notification_sender.clone();
                    let start_difficulty = self.config.start_difficulty;
                    tokio::spawn(async move {
                        Self::handle_connection(
                            registry,
                            peer_addr,
                            stream,
                            connections,
                            notification_sender,
                            start_difficulty,
                        )
                        .await;
                    });
                }
                Err(e) => log::error!("stratum accept failed: {e}"),
            }
        }
    }

    async fn handle_connection(
        registry: Arc<TemplateRegistry>,
        peer_addr: SocketAddr,
        stream: tokio::net::TcpStream,
        connections: Arc<Mutex<ConnectionMapping>>,
        notification_sender: mpsc::Sender<NotifyCmd>,
        start_difficulty: f64,
    ) {
        const MAX_LINE_LENGTH: usize = 2_usize.pow(16);
        let (reader, mut writer) = stream.into_split();
        let mut framed = FramedRead::new(BufReader::new(reader), LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        log::info!("connection established from {peer_addr}");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(1024);
        connections.lock().await.new_connection(peer_addr.to_string(), outbound_tx);

        let mut client = DownstreamClient::new(Vec::new(), registry.extranonce2_size, start_difficulty);
        client.downstream_ip = peer_addr.to_string();

        loop {
            tokio::select! {
                Some(line) = outbound_rx.recv() => {
                    if let Err(e) = writer.write_all(format!("{line}\n").as_bytes()).await {
                        log::error!("write to {peer_addr} failed: {e}");
                        break;
                    }
                }
                line = framed.next().fuse() => {
                    match line {
                        Some(Ok(line)) => {
                            if line.is_empty() {
                                continue;
                            }
                            Self::handle_line(&mut client, &registry, &line, &peer_addr, &notification_sender, &connections).await;
                        }
                        Some(Err(e)) => {
                            log::error!("error reading line from {peer_addr}: {e}");
                            break;
                        }
                        None => {
                            log::info!("connection closed by {peer_addr}");
                            break;
                        }
                    }
                }
            }
        }
        connections.lock().await.remove_connection(&peer_addr.to_string());
    }

    async fn handle_line(
        client: &mut DownstreamClient,
        registry: &Arc<TemplateRegistry>,
        line: &str,
        peer_addr: &SocketAddr,
        notification_sender: &mpsc::Sender<NotifyCmd>,
        connections: &Arc<Mutex<ConnectionMapping>>,
    ) {
        let request: StandardRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                log::error!("failed to parse JSON from {peer_addr}: {e}. line: '{line}'");
                return;
            }
        };
        let method = request.method.clone();
        let was_ready = client.subscribed && client.authorized;

        match client.handle_request(registry, &request).await {
            Ok(response_line) => {
                if let Some(sender) = connections.lock().await.get(&peer_addr.to_string()) {
                    let _ = sender.send(response_line).await;
                }
                if !was_ready && client.subscribed && client.authorized && method != "mining.submit" {
                    let _ = notification_sender
                        .send(NotifyCmd::SendLatestTemplateToNewDownstream {
                            new_downstream_addr: peer_addr.to_string(),
                        })
                        .await;
                }
            }
            Err(e) => {
                log::warn!("request {method} from {peer_addr} failed: {e}");
                let response = StandardResponse::new_err(Some(request.id), e.to_string());
                if let Some(sender) = connections.lock().await.get(&peer_addr.to_string()) {
                    let _ = sender.send(serde_json::to_string(&response).unwrap()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::NoopCallback;
    use crate::hash::Algorithm;
    use crate::rpc::test_support::{minimal_template, FakeUpstreamRpc};
    use bitcoin::ScriptBuf;

    fn payout_script() -> ScriptBuf {
        ScriptBuf::from_hex("76a914000000000000000000000000000000000000000088ac").unwrap()
    }

    async fn make_registry() -> Arc<TemplateRegistry> {
        let upstream = Arc::new(FakeUpstreamRpc::new(vec![minimal_template([0xaa; 32], 100, [0xff; 32])]));
        let cb = Arc::new(NoopCallback);
        let registry = Arc::new(TemplateRegistry::new(
            upstream,
            cb.clone(),
            cb,
            Algorithm::Sha256d,
            false,
            0,
            payout_script(),
        ));
        registry.update_block().await;
        registry
    }

    #[tokio::test]
    async fn subscribe_allocates_extranonce1_and_reports_size() {
        let registry = make_registry().await;
        let mut client = DownstreamClient::new(Vec::new(), registry.extranonce2_size, 1.0);
        let response = client.handle_subscribe(&registry, &json!([]), 1).unwrap();
        assert!(client.subscribed);
        let result = response.result.unwrap();
        assert_eq!(result[1].as_str().unwrap().len(), 8);
        assert_eq!(result[2].as_u64().unwrap() as usize, registry.extranonce2_size);
    }

    #[tokio::test]
    async fn authorize_accepts_any_worker() {
        let registry = make_registry().await;
        let mut client = DownstreamClient::new(Vec::new(), registry.extranonce2_size, 1.0);
        let response = client
            .handle_authorize(&json!(["alice.worker1", "x"]), 2)
            .unwrap();
        assert!(client.authorized);
        assert_eq!(response.result.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn suggest_difficulty_is_echoed_and_recorded() {
        let registry = make_registry().await;
        let mut client = DownstreamClient::new(Vec::new(), registry.extranonce2_size, 1.0);
        let response = client.handle_suggest_difficulty(&json!([64.0]), 3).unwrap();
        assert_eq!(client.difficulty, 64.0);
        assert_eq!(response.result.unwrap(), json!(64.0));
    }

    #[tokio::test]
    async fn submit_unknown_job_is_a_stratum_error() {
        let registry = make_registry().await;
        let mut client = DownstreamClient::new(vec![0, 0, 0, 0], registry.extranonce2_size, 1.0);
        let result = client
            .handle_submit(&registry, &json!(["alice", "ffff", "00000000", "00000000", "00000000"]), 4)
            .await;
        assert!(matches!(result, Err(StratumErrors::ShareRejected { .. })));
    }

    #[tokio::test]
    async fn submit_above_target_is_a_plain_false_result_not_an_error() {
        let registry = make_registry().await;
        let job = registry.last_block().await.unwrap();
        let mut client = DownstreamClient::new(registry.allocate_extranonce1(), registry.extranonce2_size, 1e18);
        let ntime = format!("{:08x}", 1_700_000_000u32);
        let response = client
            .handle_submit(&registry, &json!(["alice", job.job_id, "00000000", ntime, "00000000"]), 5)
            .await
            .unwrap();
        assert_eq!(response.result.unwrap(), json!(false));
    }
}
