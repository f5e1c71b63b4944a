use chrono::{DateTime, Utc};
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Client,
};
use serde::{Deserialize, Serialize};
use tokio::{runtime::Builder, sync::mpsc};
use tracing::{error, warn};

pub type OdResults = Vec<(String, f32, [f32; 4])>;

#[derive(Debug)]
pub enum UpError {
    NoToken,
    Unauthorized,
    PostFailed(String),
    ReqwestError(String),
    ChannelError,
}

impl From<reqwest::Error> for UpError {
    fn from(value: reqwest::Error) -> Self {
        let val = format!("{value}");
        Self::ReqwestError(val)
    }
}

#[derive(Clone, Serialize, Debug, Deserialize)]
pub struct UploadConfig {
    #[serde(rename = "device")]
    pub device_name: String,
    #[serde(rename = "name")]
    pub username: String,
    #[serde(rename = "pwd")]
    pub passwd: String,
    #[serde(rename = "postUrlPrefix")]
    pub api_prefix: String,
}

/// One detection as posted upstream, stamped with the stream it came
/// from and when it was seen.
#[derive(Clone, Debug, Serialize)]
pub struct OdEvent {
    pub device: String,
    pub stream: String,
    pub label: String,
    pub prop: f32,
    pub f_box: [f32; 4],
    pub at: DateTime<Utc>,
}

#[derive(Serialize)]
struct TokenReqPayload {
    name: String,
    password: String,
}

impl TokenReqPayload {
    fn new(name: &str, password: &str) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }
}

#[derive(Deserialize)]
struct TokenRes {
    message: String,
    success: bool,
    token: String,
}

#[derive(Clone)]
struct OdResultUploader {
    config: UploadConfig,
    client: Client,
    token: Option<String>,
}

impl OdResultUploader {
    fn new(config: UploadConfig) -> Self {
        let client = Client::new();
        let token = None;

        OdResultUploader {
            config,
            client,
            token,
        }
    }

    async fn get_token(&mut self) -> Result<(), UpError> {
        let token_req = TokenReqPayload::new(&self.config.username, &self.config.passwd);
        let api_url = format!("{}getToken", &self.config.api_prefix);
        let res = self.client.post(api_url).json(&token_req).send().await?;

        match res.status().as_u16() {
            200u16 => {
                let token_res = res.json::<TokenRes>().await?;
                self.token = Some(token_res.token);
            }
            _ => {
                let msg = res.json::<TokenRes>().await?.message;
                error!("Get token request failed: {msg}");
                self.token = None;
                return Err(UpError::Unauthorized);
            }
        }
        Ok(())
    }

    async fn upload(&self, events: &[OdEvent]) -> Result<(), UpError> {
        match self.token.as_ref() {
            Some(t) => {
                let mut headers = HeaderMap::new();

                headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
                headers.insert("token", t.parse().unwrap());

                let res = self
                    .client
                    .post(format!("{}od", &self.config.api_prefix))
                    .json(events)
                    .headers(headers.to_owned())
                    .send()
                    .await?;
                match res.status().as_u16() {
                    200u16 => Ok(()),
                    401 => Err(UpError::Unauthorized),
                    s => {
                        let msg = res.json::<TokenRes>().await?.message;
                        warn!("upload od result response: {s} - {msg}");
                        Err(UpError::PostFailed(msg))
                    }
                }
            }
            None => Err(UpError::NoToken),
        }
    }
}

/// Posts detection events from its own thread so inference never waits
/// on the network. The channel holds 16 batches; when the backend falls
/// behind, newer batches are dropped at the sender.
pub struct UploaderWorker {
    device: String,
    stream: String,
    tx_events: mpsc::Sender<Vec<OdEvent>>,
}

impl UploaderWorker {
    pub fn new(config: UploadConfig, stream: &str) -> Self {
        let device = config.device_name.clone();
        let stream = stream.to_string();
        let (tx_events, mut rx_events) = mpsc::channel::<Vec<OdEvent>>(16);
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        std::thread::spawn(move || {
            rt.block_on(async move {
                let mut uploader = OdResultUploader::new(config);
                let _ = uploader.get_token().await;
                while let Some(events) = rx_events.recv().await {
                    if uploader.token.is_none() {
                        let _ = uploader.get_token().await;
                    }
                    let up = uploader.clone();
                    tokio::spawn(async move {
                        let _ = up.upload(&events).await;
                    });
                }
            })
        });
        Self {
            device,
            stream,
            tx_events,
        }
    }

    pub fn upload_odres(&self, results: &OdResults) -> Result<(), UpError> {
        if results.is_empty() {
            return Ok(());
        }
        let at = Utc::now();
        let events: Vec<OdEvent> = results
            .iter()
            .map(|(label, prop, f_box)| OdEvent {
                device: self.device.clone(),
                stream: self.stream.clone(),
                label: label.clone(),
                prop: *prop,
                f_box: *f_box,
                at,
            })
            .collect();
        self.tx_events
            .try_send(events)
            .map_err(|_| UpError::ChannelError)
    }
}
